use log::{debug, error, info, warn};
use pcap::Linktype;
use std::net::IpAddr;

use crate::capture::classifier::LinkKind;
use crate::models::config::CaptureConfig;
use crate::models::device::{sort_preferred_first, Device};
use crate::utils::error::{CaptureError, CaptureResult};

/// One captured frame, borrowed from the source's buffer
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    /// Captured bytes, at most the snapshot length
    pub data: &'a [u8],
    /// Length of the frame on the wire
    pub wire_len: usize,
}

/// An open capture handle
pub trait PacketSource: Send {
    /// Framing of the frames this source yields
    fn link_kind(&self) -> LinkKind;

    /// Read the next frame. `Ok(None)` means the read timeout elapsed with
    /// nothing captured.
    fn next_frame(&mut self) -> CaptureResult<Option<Frame<'_>>>;
}

/// Access to the platform's packet capture facility
pub trait CaptureBackend: Send + Sync {
    /// Check that the backend can be used at all
    fn probe(&self) -> CaptureResult<()>;

    /// Library version, when the backend can tell
    fn version(&self) -> Option<String> {
        None
    }

    /// Enumerate capturable devices, preferred device first
    fn devices(&self) -> CaptureResult<Vec<Device>>;

    /// Whether the process may open devices for raw capture
    fn has_capture_privilege(&self) -> bool;

    /// Open `device` for capture
    fn open(&self, device: &Device, config: &CaptureConfig) -> CaptureResult<Box<dyn PacketSource>>;
}

/// libpcap / Npcap backed capture
#[derive(Debug, Default, Clone)]
pub struct PcapBackend;

impl PcapBackend {
    pub fn new() -> Self {
        Self
    }

    /// Addresses from the OS interface table, for devices libpcap reports
    /// without any
    fn datalink_addresses() -> Vec<(String, Vec<IpAddr>)> {
        // pnet_datalink can panic on Windows adapters it does not understand
        match std::panic::catch_unwind(|| {
            pnet_datalink::interfaces()
                .into_iter()
                .map(|iface| (iface.name, iface.ips.iter().map(|net| net.ip()).collect()))
                .collect::<Vec<_>>()
        }) {
            Ok(interfaces) => interfaces,
            Err(_) => {
                warn!("pnet_datalink panicked while listing interfaces");
                Vec::new()
            }
        }
    }
}

impl CaptureBackend for PcapBackend {
    fn probe(&self) -> CaptureResult<()> {
        pcap::Device::list()
            .map(|_| ())
            .map_err(|e| CaptureError::BackendUnavailable(e.to_string()))
    }

    fn devices(&self) -> CaptureResult<Vec<Device>> {
        let preferred = match pcap::Device::lookup() {
            Ok(device) => device.map(|d| d.name),
            Err(e) => {
                debug!("No default capture device: {}", e);
                None
            }
        };

        let mut fallback = None;
        let mut devices = Vec::new();

        for device in pcap::Device::list()? {
            if device.flags.is_loopback() {
                continue;
            }

            let mut addresses: Vec<IpAddr> = device.addresses.iter().map(|a| a.addr).collect();
            if addresses.is_empty() {
                let table = fallback.get_or_insert_with(Self::datalink_addresses);
                if let Some((_, ips)) = table.iter().find(|(name, _)| *name == device.name) {
                    addresses = ips.clone();
                }
            }

            let is_preferred = preferred.as_deref() == Some(device.name.as_str());
            let mut entry = Device::new(device.name)
                .with_description(device.desc)
                .with_addresses(addresses);
            entry.is_preferred = is_preferred;
            entry.ready = device.flags.is_up() && device.flags.is_running();
            entry.wireless = device.flags.is_wireless();
            devices.push(entry);
        }

        sort_preferred_first(&mut devices);
        debug!("Enumerated {} capture devices", devices.len());
        Ok(devices)
    }

    #[cfg(target_os = "windows")]
    fn has_capture_privilege(&self) -> bool {
        use std::process::Command;

        Command::new("powershell")
            .args([
                "-Command",
                "[bool](([System.Security.Principal.WindowsIdentity]::GetCurrent()).groups -match 'S-1-5-32-544')",
            ])
            .output()
            .map(|output| String::from_utf8_lossy(&output.stdout).trim() == "True")
            .unwrap_or(false)
    }

    #[cfg(not(target_os = "windows"))]
    fn has_capture_privilege(&self) -> bool {
        // Opening a device is the only reliable test: root, CAP_NET_RAW and
        // access to /dev/bpf* all grant it.
        let name = match pcap::Device::lookup() {
            Ok(Some(device)) => device.name,
            _ => return true,
        };

        let opened = pcap::Capture::from_device(name.as_str()).and_then(|c| c.timeout(1).open());
        match opened {
            Ok(_) => true,
            Err(e) => !matches!(CaptureError::from(e), CaptureError::InsufficientPermissions),
        }
    }

    fn open(&self, device: &Device, config: &CaptureConfig) -> CaptureResult<Box<dyn PacketSource>> {
        info!(
            "Opening {} (snaplen {}, promiscuous {})",
            device.name, config.snaplen, config.promiscuous
        );

        let mut capture = pcap::Capture::from_device(device.name.as_str())?
            .promisc(config.promiscuous)
            .snaplen(config.snaplen)
            .timeout(config.read_timeout().as_millis() as i32)
            .immediate_mode(true)
            .open()?;

        if let Some(filter) = &config.filter {
            match capture.filter(filter, true) {
                Ok(()) => debug!("Applied filter: {}", filter),
                // Unfiltered capture still classifies correctly, just with more work
                Err(e) => error!("Failed to apply filter, capturing unfiltered: {}", e),
            }
        }

        let datalink = capture.get_datalink();
        let link = link_kind(datalink).unwrap_or_else(|| {
            warn!("Unsupported link type {:?} on {}, assuming Ethernet", datalink, device.name);
            LinkKind::Ethernet
        });

        Ok(Box::new(PcapSource { capture, link }))
    }
}

fn link_kind(datalink: Linktype) -> Option<LinkKind> {
    if datalink == Linktype::ETHERNET {
        Some(LinkKind::Ethernet)
    } else if datalink == Linktype::LINUX_SLL {
        Some(LinkKind::LinuxSll)
    } else if datalink == Linktype::NULL || datalink == Linktype::LOOP {
        Some(LinkKind::Null)
    } else if datalink == Linktype::RAW || datalink == Linktype::IPV4 || datalink == Linktype::IPV6 {
        Some(LinkKind::Raw)
    } else {
        None
    }
}

struct PcapSource {
    capture: pcap::Capture<pcap::Active>,
    link: LinkKind,
}

impl PacketSource for PcapSource {
    fn link_kind(&self) -> LinkKind {
        self.link
    }

    fn next_frame(&mut self) -> CaptureResult<Option<Frame<'_>>> {
        match self.capture.next_packet() {
            Ok(packet) => Ok(Some(Frame {
                data: packet.data,
                wire_len: packet.header.len as usize,
            })),
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(pcap::Error::NoMorePackets) => Err(CaptureError::Io("capture handle closed".into())),
            Err(e) => Err(e.into()),
        }
    }
}
