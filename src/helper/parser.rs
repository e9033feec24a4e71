use super::Reader;
use crate::helper::Result;

/// Big-endian primitive reads. The bundle format and every MIPS ELF input
/// this crate accepts are big-endian only (§4.1), so unlike a general-purpose
/// binary parser this trait does not need to be generic over endianness.
pub trait Parser: Reader {
    #[inline]
    fn u8(&mut self) -> Result<u8> { Ok(self.read_array::<1>()?[0]) }

    #[inline]
    fn bu16(&mut self) -> Result<u16> { Ok(u16::from_be_bytes(self.read_array::<2>()?)) }

    #[inline]
    fn bu32(&mut self) -> Result<u32> { Ok(u32::from_be_bytes(self.read_array::<4>()?)) }

    #[inline]
    fn bu32_array<const L: usize>(&mut self) -> Result<[u32; L]> {
        let mut out = [0u32; L];
        for slot in out.iter_mut() {
            *slot = self.bu32()?;
        }
        Ok(out)
    }
}

impl<Base: Reader> Parser for Base {}
