/// Read a specified field from the current VMCS.
///
/// Returns 0 if VMREAD fails, which happens outside VMX root operation or without a current VMCS.
pub fn vmread(field: u32) -> u64 {
    unsafe { x86::bits64::vmx::vmread(field) }.unwrap_or(0)
}
