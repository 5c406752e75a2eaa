//! Architecture-specific context switching
//!
//! Assembly implementations for saving and restoring callee-saved state
//! when control moves between a thread's main coroutine and a pooled one.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use x86_64 as current;
    } else {
        compile_error!("corio supports x86_64 only");
    }
}

/// Callee-saved register snapshot for a cooperative switch.
///
/// Field order is load-bearing: the switch assembly addresses fields by
/// fixed offset from the struct base.
///
/// | offset | field |
/// |--------|-------|
/// | 0x00   | rsp   |
/// | 0x08   | rip   |
/// | 0x10   | rbx   |
/// | 0x18   | rbp   |
/// | 0x20   | r12   |
/// | 0x28   | r13   |
/// | 0x30   | r14   |
/// | 0x38   | r15   |
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SwitchContext {
    pub rsp: u64,
    pub rip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl SwitchContext {
    pub const fn zeroed() -> Self {
        SwitchContext {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_switch_context_layout() {
        // The asm depends on these offsets.
        assert_eq!(std::mem::size_of::<SwitchContext>(), 64);
        assert_eq!(std::mem::offset_of!(SwitchContext, rsp), 0x00);
        assert_eq!(std::mem::offset_of!(SwitchContext, rip), 0x08);
        assert_eq!(std::mem::offset_of!(SwitchContext, rbx), 0x10);
        assert_eq!(std::mem::offset_of!(SwitchContext, rbp), 0x18);
        assert_eq!(std::mem::offset_of!(SwitchContext, r12), 0x20);
        assert_eq!(std::mem::offset_of!(SwitchContext, r13), 0x28);
        assert_eq!(std::mem::offset_of!(SwitchContext, r14), 0x30);
        assert_eq!(std::mem::offset_of!(SwitchContext, r15), 0x38);
    }
}
