/// Byte-addressed access to a controller's register window.
pub trait RegisterIo: Send + Sync {
    fn read_reg8(&self, offset: u32) -> u8;
    fn read_reg16(&self, offset: u32) -> u16;
    fn read_reg32(&self, offset: u32) -> u32;
    fn write_reg8(&self, offset: u32, value: u8);
    fn write_reg16(&self, offset: u32, value: u16);
    fn write_reg32(&self, offset: u32, value: u32);
}

/// Implements [`RegisterIo`] as volatile MMIO on `self.$field_name`.
#[macro_export]
macro_rules! impl_register_io {
    ($struct_name:ident, $field_name:ident) => {
        impl $crate::regs::RegisterIo for $struct_name {
            #[inline]
            fn read_reg8(&self, offset: u32) -> u8 {
                unsafe {
                    ::core::ptr::read_volatile((self.$field_name + offset as usize) as *const u8)
                }
            }

            #[inline]
            fn read_reg16(&self, offset: u32) -> u16 {
                unsafe {
                    ::core::ptr::read_volatile((self.$field_name + offset as usize) as *const u16)
                }
            }

            #[inline]
            fn read_reg32(&self, offset: u32) -> u32 {
                unsafe {
                    ::core::ptr::read_volatile((self.$field_name + offset as usize) as *const u32)
                }
            }

            #[inline]
            fn write_reg8(&self, offset: u32, value: u8) {
                unsafe {
                    ::core::ptr::write_volatile(
                        (self.$field_name + offset as usize) as *mut u8,
                        value,
                    )
                }
            }

            #[inline]
            fn write_reg16(&self, offset: u32, value: u16) {
                unsafe {
                    ::core::ptr::write_volatile(
                        (self.$field_name + offset as usize) as *mut u16,
                        value,
                    )
                }
            }

            #[inline]
            fn write_reg32(&self, offset: u32, value: u32) {
                unsafe {
                    ::core::ptr::write_volatile(
                        (self.$field_name + offset as usize) as *mut u32,
                        value,
                    )
                }
            }
        }
    };
}

/// A memory-mapped SDHCI register window.
#[derive(Debug, Clone, Copy)]
pub struct MmioRegs {
    pub base_addr: usize,
}

impl MmioRegs {
    /// # Safety
    ///
    /// `base_addr` must map the controller's register block for the
    /// lifetime of the value.
    pub unsafe fn new(base_addr: usize) -> Self {
        Self { base_addr }
    }
}

impl_register_io!(MmioRegs, base_addr);
