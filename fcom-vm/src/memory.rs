//! Emulated memory: one contiguous host buffer with an ordered
//! permission map.
//!
//! Map entries mark permission transitions; lookups binary-search the
//! entry list with per-purpose cached indices (fetch, constant read,
//! data read/write) for locality.

use fcom_obj::{ObjectFile, SectionFlags, SectionType};

use crate::error::{EmuError, Interrupt};

bitflags::bitflags! {
    /// Access permissions of a mapped range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Perm: u8 {
        /// Readable.
        const READ = 1;
        /// Writable.
        const WRITE = 2;
        /// Executable.
        const EXEC = 4;
    }
}

/// One permission transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry {
    /// First address of the range.
    pub start: u64,
    /// Permissions until the next entry.
    pub perm: Perm,
}

/// Cache slots for the three access purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// Instruction fetch.
    Fetch = 0,
    /// Read-only data.
    ReadConst = 1,
    /// Read/write data.
    ReadWrite = 2,
}

/// The emulated memory image.
#[derive(Debug)]
pub struct Memory {
    base: u64,
    bytes: Vec<u8>,
    map: Vec<MapEntry>,
    cache: [usize; 3],
}

impl Memory {
    /// Build the image from an executable's sections, appending a stack
    /// and heap region of the given sizes.
    pub fn from_executable(
        exe: &ObjectFile,
        stack_size: u64,
        heap_size: u64,
    ) -> Result<(Self, u64), EmuError> {
        let loadable: Vec<_> = exe
            .sections
            .iter()
            .filter(|s| s.size() > 0)
            .collect();
        if loadable.is_empty() {
            return Err(EmuError::EmptyImage);
        }
        let base = loadable.iter().map(|s| s.addr).min().unwrap_or(0);
        let image_end = loadable
            .iter()
            .map(|s| s.addr + s.size())
            .max()
            .unwrap_or(0);
        let stack_start = (image_end + 0xfff) & !0xfff;
        let end = stack_start + stack_size + heap_size;
        let total = usize::try_from(end - base).map_err(|_| EmuError::ImageTooLarge)?;
        if total > 1 << 32 {
            return Err(EmuError::ImageTooLarge);
        }

        let mut bytes = vec![0u8; total];
        let mut edges: Vec<MapEntry> = Vec::new();
        for s in &loadable {
            if s.sh_type != Some(SectionType::Nobits) {
                let at = (s.addr - base) as usize;
                bytes[at..at + s.data.len()].copy_from_slice(&s.data);
            }
            let mut perm = Perm::empty();
            if s.flags.contains(SectionFlags::READ) {
                perm |= Perm::READ;
            }
            if s.flags.contains(SectionFlags::WRITE) {
                perm |= Perm::WRITE;
            }
            if s.flags.contains(SectionFlags::EXEC) {
                perm |= Perm::EXEC;
            }
            edges.push(MapEntry {
                start: s.addr,
                perm,
            });
            edges.push(MapEntry {
                start: s.addr + s.size(),
                perm: Perm::empty(),
            });
        }
        // stack and heap
        edges.push(MapEntry {
            start: stack_start,
            perm: Perm::READ | Perm::WRITE,
        });
        edges.push(MapEntry {
            start: end,
            perm: Perm::empty(),
        });

        // collapse into an ordered transition list; later loadable entries
        // win over the empty gap markers at the same address
        edges.sort_by_key(|e| (e.start, e.perm.is_empty()));
        let mut map: Vec<MapEntry> = Vec::new();
        for e in edges {
            match map.last_mut() {
                Some(last) if last.start == e.start => {
                    if last.perm.is_empty() {
                        last.perm = e.perm;
                    }
                }
                Some(last) if last.perm == e.perm => {}
                _ => map.push(e),
            }
        }

        let sp_init = stack_start + stack_size;
        Ok((
            Self {
                base,
                bytes,
                map,
                cache: [0; 3],
            },
            sp_init,
        ))
    }

    /// Lowest mapped address.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// The permission map.
    pub fn map(&self) -> &[MapEntry] {
        &self.map
    }

    /// Verify `addr..addr+len` under `need`, returning the host offset.
    pub fn check(
        &mut self,
        addr: u64,
        len: u64,
        need: Perm,
        purpose: Purpose,
    ) -> Result<usize, Interrupt> {
        let fail = || match purpose {
            Purpose::Fetch => Interrupt::AccessExecute,
            Purpose::ReadConst => Interrupt::AccessRead,
            Purpose::ReadWrite => {
                if need.contains(Perm::WRITE) {
                    Interrupt::AccessWrite
                } else {
                    Interrupt::AccessRead
                }
            }
        };
        let slot = purpose as usize;
        let cached = self.cache[slot];
        let index = if self.entry_covers(cached, addr) {
            cached
        } else {
            let index = match self.map.binary_search_by_key(&addr, |e| e.start) {
                Ok(i) => i,
                Err(0) => return Err(fail()),
                Err(i) => i - 1,
            };
            self.cache[slot] = index;
            index
        };
        let entry = self.map[index];
        if !entry.perm.contains(need) {
            return Err(fail());
        }
        let range_end = self
            .map
            .get(index + 1)
            .map(|e| e.start)
            .unwrap_or(self.base + self.bytes.len() as u64);
        let end = addr.checked_add(len).ok_or_else(fail)?;
        if end > range_end {
            return Err(fail());
        }
        Ok((addr - self.base) as usize)
    }

    fn entry_covers(&self, index: usize, addr: u64) -> bool {
        let Some(entry) = self.map.get(index) else {
            return false;
        };
        let end = self
            .map
            .get(index + 1)
            .map(|e| e.start)
            .unwrap_or(u64::MAX);
        entry.start <= addr && addr < end
    }

    /// Aligned load of up to 8 bytes.
    pub fn read(
        &mut self,
        addr: u64,
        size: u32,
        purpose: Purpose,
    ) -> Result<u64, Interrupt> {
        if addr % u64::from(size) != 0 {
            return Err(Interrupt::MisalignedMemory);
        }
        let at = self.check(addr, u64::from(size), Perm::READ, purpose)?;
        let mut v = 0u64;
        for i in 0..size.min(8) as usize {
            v |= u64::from(self.bytes[at + i]) << (8 * i);
        }
        Ok(v)
    }

    /// Aligned store of up to 8 bytes.
    pub fn write(&mut self, addr: u64, size: u32, value: u64) -> Result<(), Interrupt> {
        if addr % u64::from(size) != 0 {
            return Err(Interrupt::MisalignedMemory);
        }
        let at = self.check(addr, u64::from(size), Perm::WRITE, Purpose::ReadWrite)?;
        for i in 0..size.min(8) as usize {
            self.bytes[at + i] = (value >> (8 * i)) as u8;
        }
        Ok(())
    }

    /// Fetch one instruction word.
    pub fn fetch(&mut self, addr: u64) -> Result<u32, Interrupt> {
        if addr % 4 != 0 {
            return Err(Interrupt::MisalignedJump);
        }
        let at = self.check(addr, 4, Perm::EXEC, Purpose::Fetch)?;
        Ok(u32::from_le_bytes([
            self.bytes[at],
            self.bytes[at + 1],
            self.bytes[at + 2],
            self.bytes[at + 3],
        ]))
    }

    /// Byte-wise read without alignment demands, for vector memory.
    pub fn read_bytes_into(
        &mut self,
        addr: u64,
        out: &mut [u8],
        purpose: Purpose,
    ) -> Result<(), Interrupt> {
        let at = self.check(addr, out.len() as u64, Perm::READ, purpose)?;
        out.copy_from_slice(&self.bytes[at..at + out.len()]);
        Ok(())
    }

    /// Byte-wise write without alignment demands, for vector memory.
    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<(), Interrupt> {
        let at = self.check(addr, data.len() as u64, Perm::WRITE, Purpose::ReadWrite)?;
        self.bytes[at..at + data.len()].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fcom_obj::Section;

    fn test_image() -> (Memory, u64) {
        let mut exe = ObjectFile::new();
        exe.is_executable = true;
        exe.add_section(Section {
            name: "code".into(),
            sh_type: Some(SectionType::Progbits),
            flags: SectionFlags::EXEC | SectionFlags::READ | SectionFlags::IP,
            addr: 0x1_0000,
            align: 2,
            data: vec![0xaa; 16],
            ..Section::default()
        });
        exe.add_section(Section {
            name: "data".into(),
            sh_type: Some(SectionType::Progbits),
            flags: SectionFlags::READ | SectionFlags::WRITE | SectionFlags::DATAP,
            addr: 0x2_0000,
            align: 3,
            data: vec![0x55; 32],
            ..Section::default()
        });
        Memory::from_executable(&exe, 0x1000, 0x1000).expect("image")
    }

    #[test]
    fn permissions_are_enforced() {
        let (mut mem, sp) = test_image();
        // code fetches but does not write
        assert!(mem.fetch(0x1_0000).is_ok());
        assert_eq!(mem.write(0x1_0000, 4, 0), Err(Interrupt::AccessWrite));
        // data reads and writes but does not fetch
        assert!(mem.read(0x2_0000, 8, Purpose::ReadWrite).is_ok());
        assert!(mem.write(0x2_0000, 8, 42).is_ok());
        assert_eq!(mem.fetch(0x2_0000), Err(Interrupt::AccessExecute));
        // the gap between code and data is unmapped
        assert_eq!(
            mem.read(0x1_8000, 4, Purpose::ReadConst),
            Err(Interrupt::AccessRead)
        );
        // the stack is writable and the initial sp is its top
        assert!(mem.write(sp - 8, 8, 7).is_ok());
    }

    #[test]
    fn alignment_is_enforced() {
        let (mut mem, _) = test_image();
        assert_eq!(
            mem.read(0x2_0001, 4, Purpose::ReadWrite),
            Err(Interrupt::MisalignedMemory)
        );
        assert_eq!(mem.fetch(0x1_0002), Err(Interrupt::MisalignedJump));
    }

    #[test]
    fn values_round_trip() {
        let (mut mem, _) = test_image();
        mem.write(0x2_0008, 8, 0xdead_beef_cafe_f00d).unwrap();
        assert_eq!(
            mem.read(0x2_0008, 8, Purpose::ReadWrite).unwrap(),
            0xdead_beef_cafe_f00d
        );
        mem.write(0x2_0010, 2, 0x1234).unwrap();
        assert_eq!(mem.read(0x2_0010, 2, Purpose::ReadWrite).unwrap(), 0x1234);
    }

    #[test]
    fn map_entries_are_ordered() {
        let (mem, _) = test_image();
        let map = mem.map();
        assert!(map.windows(2).all(|w| w[0].start < w[1].start));
    }
}
