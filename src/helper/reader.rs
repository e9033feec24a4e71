use std::io::Read;

use crate::helper::Result;

/// Minimal byte-slurping surface every [`Parser`][super::Parser] is built on.
pub trait Reader {
    fn read_as_vec(&mut self, size: usize) -> Result<Vec<u8>>;
    fn read_into(&mut self, buffer: &mut [u8]) -> Result<()>;
    fn read_array<const L: usize>(&mut self) -> Result<[u8; L]>;
}

impl<Base> Reader for Base
where
    Base: Read + Sized,
{
    fn read_as_vec(&mut self, size: usize) -> Result<Vec<u8>> {
        let mut data = vec![0u8; size];
        self.read_exact(&mut data)?;
        Ok(data)
    }

    #[inline]
    fn read_into(&mut self, buffer: &mut [u8]) -> Result<()> {
        self.read_exact(buffer)?;
        Ok(())
    }

    #[inline]
    fn read_array<const L: usize>(&mut self) -> Result<[u8; L]> {
        let mut buf = [0u8; L];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}
