//! Implements [`RawTransport`] on top of Linux hidraw device nodes.
//!
//! Blocking reads wait on the device node and on the read end of a pipe at
//! the same time. [`RawTransport::interrupt_read`] writes a single byte into
//! the pipe, which wakes the reader no matter which thread it runs on.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use tracing::debug;

use super::{RawTransport, TransportError};

/// The largest report descriptor the kernel hands out.
pub const HID_MAX_DESCRIPTOR_SIZE: usize = 4096;

const MAX_NAME_LENGTH: usize = 256;

const HIDRAW_IOCTL_TYPE: u8 = b'H';
const HIDIOC_NR_GRDESCSIZE: u8 = 0x01;
const HIDIOC_NR_GRDESC: u8 = 0x02;
const HIDIOC_NR_GRAWINFO: u8 = 0x03;
const HIDIOC_NR_GRAWNAME: u8 = 0x04;

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = 8;
const IOC_SIZESHIFT: u32 = 16;
const IOC_DIRSHIFT: u32 = 30;
const IOC_READ: u32 = 2;

/// Mirrors `struct hidraw_devinfo` from `linux/hidraw.h`.
#[repr(C)]
#[derive(Default)]
struct HidrawDevInfo {
    bustype: u32,
    vendor: i16,
    product: i16,
}

/// Mirrors `struct hidraw_report_descriptor` from `linux/hidraw.h`.
#[repr(C)]
struct HidrawReportDescriptor {
    size: u32,
    value: [u8; HID_MAX_DESCRIPTOR_SIZE],
}

const fn ioc_read(nr: u8, size: usize) -> libc::c_ulong {
    ((IOC_READ << IOC_DIRSHIFT)
        | ((HIDRAW_IOCTL_TYPE as u32) << IOC_TYPESHIFT)
        | ((nr as u32) << IOC_NRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)) as libc::c_ulong
}

const HIDIOCGRDESCSIZE: libc::c_ulong =
    ioc_read(HIDIOC_NR_GRDESCSIZE, mem::size_of::<libc::c_int>());
const HIDIOCGRDESC: libc::c_ulong =
    ioc_read(HIDIOC_NR_GRDESC, mem::size_of::<HidrawReportDescriptor>());
const HIDIOCGRAWINFO: libc::c_ulong =
    ioc_read(HIDIOC_NR_GRAWINFO, mem::size_of::<HidrawDevInfo>());
const HIDIOCGRAWNAME: libc::c_ulong = ioc_read(HIDIOC_NR_GRAWNAME, MAX_NAME_LENGTH);

/// An opened `/dev/hidrawN` node.
///
/// Identity information and the report descriptor are queried once when the
/// node is opened.
#[derive(Debug)]
pub struct Hidraw {
    path: PathBuf,
    file: File,
    interrupt_rx: File,
    interrupt_tx: File,
    vendor_id: u16,
    product_id: u16,
    name: String,
    report_descriptor: Vec<u8>,
}

impl Hidraw {
    /// Opens a hidraw node for reading and writing.
    ///
    /// Returns [`TransportError::DeviceNotFound`] if the node does not exist
    /// and [`TransportError::PermissionDenied`] if the process lacks access
    /// rights.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let (interrupt_rx, interrupt_tx) = pipe()?;

        let info = raw_info(&file)?;
        let name = raw_name(&file)?;
        let report_descriptor = raw_report_descriptor(&file)?;

        debug!(
            path = %path.display(),
            bus = info.bustype,
            vendor_id = format_args!("{:#06x}", info.vendor as u16),
            product_id = format_args!("{:#06x}", info.product as u16),
            name = %name,
            "opened hidraw node"
        );

        Ok(Self {
            path: path.to_path_buf(),
            file,
            interrupt_rx,
            interrupt_tx,
            vendor_id: info.vendor as u16,
            product_id: info.product as u16,
            name,
            report_descriptor,
        })
    }

    /// The path the node was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RawTransport for Hidraw {
    fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    fn product_id(&self) -> u16 {
        self.product_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn write_report(&self, src: &[u8]) -> Result<usize, TransportError> {
        Ok((&self.file).write(src)?)
    }

    fn read_report(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize, TransportError> {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));

        loop {
            let mut fds = [
                libc::pollfd {
                    fd: self.file.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.interrupt_rx.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];

            // SAFETY: `fds` is a valid array of `pollfd` for the duration of the call.
            let ret = unsafe {
                libc::poll(
                    fds.as_mut_ptr(),
                    fds.len() as libc::nfds_t,
                    poll_timeout(deadline),
                )
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }
            if ret == 0 {
                return Err(TransportError::Timeout);
            }

            if fds[1].revents & libc::POLLIN != 0 {
                let mut byte = [0u8; 1];
                (&self.interrupt_rx).read_exact(&mut byte)?;
                return Err(TransportError::Interrupted);
            }

            if fds[0].revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0 {
                return Err(TransportError::Closed);
            }

            if fds[0].revents & libc::POLLIN != 0 {
                return match (&self.file).read(buf) {
                    Ok(0) => Err(TransportError::Closed),
                    Ok(len) => Ok(len),
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => Err(err.into()),
                };
            }
        }
    }

    fn interrupt_read(&self) -> Result<(), TransportError> {
        (&self.interrupt_tx).write_all(&[0])?;
        Ok(())
    }

    fn report_descriptor(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let len = self.report_descriptor.len().min(buf.len());
        buf[..len].copy_from_slice(&self.report_descriptor[..len]);
        Ok(len)
    }
}

/// Converts an optional deadline into a `poll` timeout in milliseconds.
///
/// The remaining time is rounded up so that a sub-millisecond remainder does
/// not turn into a zero timeout before the deadline actually passed.
fn poll_timeout(deadline: Option<Instant>) -> libc::c_int {
    let Some(deadline) = deadline else {
        return -1;
    };

    let remaining = deadline.saturating_duration_since(Instant::now());
    remaining
        .as_micros()
        .div_ceil(1000)
        .min(libc::c_int::MAX as u128) as libc::c_int
}

fn pipe() -> io::Result<(File, File)> {
    let mut fds = [0 as libc::c_int; 2];

    // SAFETY: `fds` has room for the two descriptors `pipe2` writes.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: `pipe2` just created both descriptors and nothing else owns them.
    let (rx, tx) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    Ok((File::from(rx), File::from(tx)))
}

fn raw_info(file: &File) -> io::Result<HidrawDevInfo> {
    let mut info = HidrawDevInfo::default();

    // SAFETY: HIDIOCGRAWINFO writes one `hidraw_devinfo` into `info`.
    if unsafe { libc::ioctl(file.as_raw_fd(), HIDIOCGRAWINFO, &mut info) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(info)
}

fn raw_name(file: &File) -> io::Result<String> {
    let mut buf = [0u8; MAX_NAME_LENGTH];

    // SAFETY: HIDIOCGRAWNAME writes at most `MAX_NAME_LENGTH` bytes into `buf`.
    if unsafe { libc::ioctl(file.as_raw_fd(), HIDIOCGRAWNAME, buf.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }

    let end = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).trim().to_string())
}

fn raw_report_descriptor(file: &File) -> io::Result<Vec<u8>> {
    let mut size: libc::c_int = 0;

    // SAFETY: HIDIOCGRDESCSIZE writes one `int` into `size`.
    if unsafe { libc::ioctl(file.as_raw_fd(), HIDIOCGRDESCSIZE, &mut size) } < 0 {
        return Err(io::Error::last_os_error());
    }

    let mut descriptor = Box::new(HidrawReportDescriptor {
        size: size.clamp(0, HID_MAX_DESCRIPTOR_SIZE as libc::c_int) as u32,
        value: [0u8; HID_MAX_DESCRIPTOR_SIZE],
    });

    // SAFETY: HIDIOCGRDESC fills at most `descriptor.size` bytes of `value`.
    if unsafe { libc::ioctl(file.as_raw_fd(), HIDIOCGRDESC, &mut *descriptor) } < 0 {
        return Err(io::Error::last_os_error());
    }

    let len = (descriptor.size as usize).min(HID_MAX_DESCRIPTOR_SIZE);
    Ok(descriptor.value[..len].to_vec())
}
