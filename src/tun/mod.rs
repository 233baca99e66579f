//! TUN device I/O.
//!
//! The tunnel dataplane only needs two operations — read one IP packet,
//! write one IP packet — expressed by [`TunIo`]. The real implementation
//! wraps a Linux TUN file descriptor; [`ChannelTun`] is an in-memory double
//! so the dataplane can be exercised in tests without privileges.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Packet-level access to the virtual interface.
#[async_trait]
pub trait TunIo: Send + Sync {
    /// Read the next IP packet from the device.
    async fn read_packet(&self) -> Result<Bytes>;

    /// Write one IP packet to the device.
    async fn write_packet(&self, pkt: &[u8]) -> Result<()>;
}

#[cfg(target_os = "linux")]
mod device {
    use std::os::fd::{AsRawFd, OwnedFd};

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::io::unix::AsyncFd;
    use tracing::info;

    use crate::error::{Error, Result};
    use crate::MAX_PACKET;

    /// A Linux TUN device (IFF_TUN | IFF_NO_PI).
    pub struct TunDevice {
        fd: AsyncFd<OwnedFd>,
        name: String,
    }

    impl TunDevice {
        /// Open `/dev/net/tun` and attach to (or create) the named device.
        pub fn open(name: &str) -> Result<Self> {
            use std::fs::OpenOptions;
            use std::os::unix::fs::OpenOptionsExt;

            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open("/dev/net/tun")?;

            let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
            let name_bytes = name.as_bytes();
            let copy_len = name_bytes.len().min(libc::IFNAMSIZ - 1);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    name_bytes.as_ptr(),
                    ifr.ifr_name.as_mut_ptr().cast::<u8>(),
                    copy_len,
                );
            }
            ifr.ifr_ifru.ifru_flags = (libc::IFF_TUN | libc::IFF_NO_PI) as i16;

            const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
            let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF, &mut ifr) };
            if ret < 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }

            let actual_name = unsafe {
                std::ffi::CStr::from_ptr(ifr.ifr_name.as_ptr())
                    .to_string_lossy()
                    .into_owned()
            };
            info!(requested = %name, actual = %actual_name, "opened TUN device");

            let owned: OwnedFd = file.into();
            Ok(Self {
                fd: AsyncFd::new(owned)?,
                name: actual_name,
            })
        }

        pub fn name(&self) -> &str {
            &self.name
        }
    }

    #[async_trait]
    impl super::TunIo for TunDevice {
        async fn read_packet(&self) -> Result<Bytes> {
            let mut buf = vec![0u8; MAX_PACKET];
            loop {
                let mut guard = self.fd.readable().await?;
                let result = guard.try_io(|inner| {
                    let n = unsafe {
                        libc::read(
                            inner.as_raw_fd(),
                            buf.as_mut_ptr().cast::<libc::c_void>(),
                            buf.len(),
                        )
                    };
                    if n < 0 {
                        Err(std::io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                });
                match result {
                    Ok(Ok(n)) => {
                        buf.truncate(n);
                        return Ok(Bytes::from(buf));
                    }
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_would_block) => continue,
                }
            }
        }

        async fn write_packet(&self, pkt: &[u8]) -> Result<()> {
            loop {
                let mut guard = self.fd.writable().await?;
                let result = guard.try_io(|inner| {
                    let n = unsafe {
                        libc::write(
                            inner.as_raw_fd(),
                            pkt.as_ptr().cast::<libc::c_void>(),
                            pkt.len(),
                        )
                    };
                    if n < 0 {
                        Err(std::io::Error::last_os_error())
                    } else {
                        Ok(())
                    }
                });
                match result {
                    Ok(Ok(())) => return Ok(()),
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_would_block) => continue,
                }
            }
        }
    }
}

#[cfg(target_os = "linux")]
pub use device::TunDevice;

/// In-memory TUN double for tests: packets "read from the device" are
/// injected through a channel, packets "written to the device" come out of
/// another.
pub struct ChannelTun {
    ingress: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    egress: mpsc::Sender<Bytes>,
}

impl ChannelTun {
    /// Build a double plus its test handles: send on the returned sender to
    /// make packets appear on the TUN read side, receive on the returned
    /// receiver to observe TUN writes.
    pub fn new(capacity: usize) -> (Self, mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
        let (inject_tx, inject_rx) = mpsc::channel(capacity);
        let (observe_tx, observe_rx) = mpsc::channel(capacity);
        (
            Self {
                ingress: tokio::sync::Mutex::new(inject_rx),
                egress: observe_tx,
            },
            inject_tx,
            observe_rx,
        )
    }
}

#[async_trait]
impl TunIo for ChannelTun {
    async fn read_packet(&self) -> Result<Bytes> {
        self.ingress
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ConnectionClosed)
    }

    async fn write_packet(&self, pkt: &[u8]) -> Result<()> {
        self.egress
            .send(Bytes::copy_from_slice(pkt))
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_tun_round_trip() {
        let (tun, inject, mut observe) = ChannelTun::new(8);

        inject.send(Bytes::from_static(b"packet-in")).await.unwrap();
        assert_eq!(tun.read_packet().await.unwrap().as_ref(), b"packet-in");

        tun.write_packet(b"packet-out").await.unwrap();
        assert_eq!(observe.recv().await.unwrap().as_ref(), b"packet-out");
    }

    #[tokio::test]
    async fn channel_tun_read_fails_after_close() {
        let (tun, inject, _observe) = ChannelTun::new(1);
        drop(inject);
        assert!(tun.read_packet().await.is_err());
    }
}
