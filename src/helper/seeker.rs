use std::io::{Seek, SeekFrom};

use crate::helper::Result;

pub trait Seeker {
    fn goto(&mut self, pos: u64) -> Result<u64>;
    fn position(&mut self) -> Result<u64>;
}

impl<Base> Seeker for Base
where
    Base: Seek + Sized,
{
    #[inline]
    fn goto(&mut self, pos: u64) -> Result<u64> { Ok(self.seek(SeekFrom::Start(pos))?) }

    #[inline]
    fn position(&mut self) -> Result<u64> { Ok(self.seek(SeekFrom::Current(0))?) }
}
