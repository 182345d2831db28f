//! Locates the loaded image (executable or shared library) containing this
//! crate.

use crate::Error;
use std::ops::Range;

/// Any function that lives in our image, we only ever use its address
#[inline(never)]
fn image_marker() {}

/// Finds the address range of the loaded image this crate is linked into,
/// from its base address to the end of its highest segment
pub fn current_image_range() -> Result<Range<usize>, Error> {
    imp::image_range(image_marker as usize)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod imp {
    use super::*;

    struct Search {
        addr: usize,
        found: Option<Range<usize>>,
    }

    unsafe extern "C" fn visit(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut libc::c_void,
    ) -> libc::c_int {
        let search = &mut *data.cast::<Search>();
        let info = &*info;

        if info.dlpi_phdr.is_null() {
            return 0;
        }

        let headers = std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
        let base = info.dlpi_addr as usize;

        let mut low = usize::MAX;
        let mut high = 0;
        for ph in headers.iter().filter(|ph| ph.p_type == libc::PT_LOAD) {
            low = low.min(ph.p_vaddr as usize);
            high = high.max((ph.p_vaddr + ph.p_memsz) as usize);
        }

        if low >= high {
            return 0;
        }

        let range = base + low..base + high;
        if range.contains(&search.addr) {
            search.found = Some(range);
            // Stop iterating
            1
        } else {
            0
        }
    }

    pub(super) fn image_range(addr: usize) -> Result<Range<usize>, Error> {
        let mut search = Search { addr, found: None };

        // SAFETY: syscall, the callback only runs for the duration of the call
        unsafe {
            libc::dl_iterate_phdr(Some(visit), (&mut search as *mut Search).cast());
        }

        search.found.ok_or(Error::ImageNotFound)
    }
}

#[cfg(target_os = "macos")]
mod imp {
    use super::*;

    /// `mach-o/loader.h`
    const LC_SEGMENT_64: u32 = 0x19;
    const MH_MAGIC_64: u32 = 0xfeed_facf;

    #[repr(C)]
    struct MachHeader64 {
        magic: u32,
        cputype: i32,
        cpusubtype: i32,
        filetype: u32,
        ncmds: u32,
        sizeofcmds: u32,
        flags: u32,
        reserved: u32,
    }

    #[repr(C)]
    struct LoadCommand {
        cmd: u32,
        cmdsize: u32,
    }

    #[repr(C)]
    struct SegmentCommand64 {
        cmd: u32,
        cmdsize: u32,
        segname: [u8; 16],
        vmaddr: u64,
        vmsize: u64,
        fileoff: u64,
        filesize: u64,
        maxprot: i32,
        initprot: i32,
        nsects: u32,
        flags: u32,
    }

    pub(super) fn image_range(addr: usize) -> Result<Range<usize>, Error> {
        // SAFETY: syscall, and the header dladdr gives us is the mapped
        // header of a loaded image
        unsafe {
            let mut info: libc::Dl_info = std::mem::zeroed();
            if libc::dladdr(addr as *const _, &mut info) == 0 || info.dli_fbase.is_null() {
                return Err(Error::ImageNotFound);
            }

            let header = &*info.dli_fbase.cast::<MachHeader64>();
            if header.magic != MH_MAGIC_64 {
                return Err(Error::ImageNotFound);
            }

            let mut cmd = (header as *const MachHeader64)
                .add(1)
                .cast::<LoadCommand>();

            let mut text_vmaddr = None;
            let mut end = 0;

            for _ in 0..header.ncmds {
                let lc = &*cmd;

                if lc.cmd == LC_SEGMENT_64 {
                    let seg = &*cmd.cast::<SegmentCommand64>();

                    // The zero page is reserved address space, not part of
                    // the image
                    if !seg.segname.starts_with(b"__PAGEZERO\0") {
                        if seg.segname.starts_with(b"__TEXT\0") {
                            text_vmaddr = Some(seg.vmaddr);
                        }
                        end = end.max(seg.vmaddr + seg.vmsize);
                    }
                }

                cmd = cmd.cast::<u8>().add(lc.cmdsize as usize).cast();
            }

            let text_vmaddr = text_vmaddr.ok_or(Error::ImageNotFound)?;

            // The image may have slid, so the range is relative to where the
            // header actually is
            let base = header as *const MachHeader64 as usize;
            Ok(base..base + (end - text_vmaddr) as usize)
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
mod imp {
    use super::*;

    pub(super) fn image_range(_addr: usize) -> Result<Range<usize>, Error> {
        Err(Error::ImageNotFound)
    }
}

#[cfg(test)]
mod test {
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn contains_our_code() {
        let range = super::current_image_range().unwrap();
        assert!(range.contains(&(super::image_marker as usize)));
        assert!(range.contains(&(contains_our_code as usize)));
    }
}
