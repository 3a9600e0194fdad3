//! GPU virtual memory: VA apertures, comptags, page tables, buffers and VMs.

pub mod aperture;
pub mod buffer;
pub mod comptags;
pub mod page_table;
pub mod vm;

pub use aperture::Aperture;
pub use buffer::{Compbits, CompressibleRead, DmaBuf};
pub use comptags::{CompbitsWindow, ComptagAllocator, Comptags};
pub use page_table::{PageSizeClass, PageTables};
pub use vm::{
    BufferRefs, CompbitsInfo, MapFlags, MapParams, MappedBufferInfo, MappingBatch, SpaceFlags, VaSnapshot, Vm,
};

/// Trait for GPU VA range allocators.
pub trait ApertureAllocator {
    /// Reserve a virtual address range within this aperture.
    fn allocate_va(&mut self, size: u64, align: u64) -> Option<u64>;

    /// Free a range previously returned by `allocate_va` or a fixed reservation.
    fn free_va(&mut self, addr: u64);

    /// The aperture's base and limit.
    fn bounds(&self) -> (u64, u64);
}

/// Surface kinds understood by the GMMU.
///
/// Compressible kinds have an uncompressed twin used when comptags cannot be
/// attached. `INVALID` requests a plain pitch mapping.
pub mod kind {
    pub const PITCH: u8 = 0x00;
    pub const Z16: u8 = 0x01;
    pub const Z16_2C: u8 = 0x02;
    pub const C32_2C: u8 = 0xdb;
    pub const GENERIC_16BX2: u8 = 0xfe;
    pub const INVALID: u8 = 0xff;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KindInfo {
        pub kind: u8,
        pub compressible: bool,
        pub uncompressed: u8,
    }

    /// Resolves a requested kind. `None` for kinds the GMMU does not support.
    #[must_use]
    pub const fn info(kind: u8) -> Option<KindInfo> {
        let (kind, compressible, uncompressed) = match kind {
            INVALID | PITCH => (PITCH, false, PITCH),
            Z16 => (Z16, false, Z16),
            GENERIC_16BX2 => (GENERIC_16BX2, false, GENERIC_16BX2),
            Z16_2C => (Z16_2C, true, Z16),
            C32_2C => (C32_2C, true, GENERIC_16BX2),
            _ => return None,
        };
        Some(KindInfo {
            kind,
            compressible,
            uncompressed,
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn compressible_kinds_have_fallbacks() {
            let k = info(C32_2C).unwrap();
            assert!(k.compressible);
            assert_eq!(k.uncompressed, GENERIC_16BX2);
            assert_eq!(info(INVALID).unwrap().kind, PITCH);
            assert!(info(0x42).is_none());
        }
    }
}
