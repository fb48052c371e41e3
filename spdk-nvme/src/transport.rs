//! NVMe transport identifier.
//!
//! Identifies the controller a session attaches to. Only the PCIe transport is
//! supported: the session drives a locally attached controller.
//!
//! The string form is SPDK's: whitespace-separated `key=value` (or
//! `key:value`) pairs, e.g. `trtype=PCIE traddr=0000:01:00.0`.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// NVMe transport types SPDK knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    Pcie,
    Rdma,
    Fc,
    Tcp,
    VfioUser,
    Custom,
}

impl TransportType {
    /// Case-insensitive lookup of a transport name.
    pub fn from_name(name: &str) -> Option<Self> {
        let ty = match name.to_ascii_uppercase().as_str() {
            "PCIE" => TransportType::Pcie,
            "RDMA" => TransportType::Rdma,
            "FC" => TransportType::Fc,
            "TCP" => TransportType::Tcp,
            "VFIOUSER" => TransportType::VfioUser,
            "CUSTOM" => TransportType::Custom,
            _ => return None,
        };
        Some(ty)
    }

    /// Canonical SPDK spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::Pcie => "PCIe",
            TransportType::Rdma => "RDMA",
            TransportType::Fc => "FC",
            TransportType::Tcp => "TCP",
            TransportType::VfioUser => "VFIOUSER",
            TransportType::Custom => "CUSTOM",
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// PCI bus/device/function address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PciAddress {
    pub domain: u32,
    pub bus: u8,
    pub dev: u8,
    pub func: u8,
}

impl PciAddress {
    /// Parse `DDDD:BB:DD.F`, `BB:DD.F` or `DDDD.BB.DD.F` (hex fields).
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidPciAddress(s.to_string());

        let fields: Vec<&str> = if s.contains(':') {
            let mut parts: Vec<&str> = s.split(':').collect();
            let last = parts.pop().ok_or_else(invalid)?;
            let (dev, func) = last.split_once('.').ok_or_else(invalid)?;
            if parts.len() == 1 {
                parts.insert(0, "0");
            }
            parts.push(dev);
            parts.push(func);
            parts
        } else {
            s.split('.').collect()
        };

        if fields.len() != 4 {
            return Err(invalid());
        }

        let domain = parse_hex(fields[0]).ok_or_else(invalid)?;
        let bus = parse_hex(fields[1]).ok_or_else(invalid)?;
        let dev = parse_hex(fields[2]).ok_or_else(invalid)?;
        let func = parse_hex(fields[3]).ok_or_else(invalid)?;

        if bus > 0xff || dev > 0x1f || func > 0x7 {
            return Err(invalid());
        }

        Ok(Self {
            domain,
            bus: bus as u8,
            dev: dev as u8,
            func: func as u8,
        })
    }
}

fn parse_hex(field: &str) -> Option<u32> {
    if field.is_empty() || !field.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(field, 16).ok()
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.dev, self.func
        )
    }
}

impl FromStr for PciAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// NVMe transport identifier for a PCIe-attached controller.
///
/// # Example
///
/// ```
/// use spdk_nvme::TransportId;
///
/// let trid = TransportId::parse("trtype=PCIE traddr=01:00.0")?;
/// assert_eq!(trid.address(), "0000:01:00.0");
/// # Ok::<(), spdk_nvme::Error>(())
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportId {
    trtype: TransportType,
    pci_addr: PciAddress,
    traddr: String,
}

impl TransportId {
    /// Create a PCIe transport ID from a BDF address.
    pub fn pcie(addr: &str) -> Result<Self> {
        let pci_addr = PciAddress::parse(addr)?;
        Ok(Self::from_pci_address(pci_addr))
    }

    /// Create a PCIe transport ID from an already parsed address.
    pub fn from_pci_address(pci_addr: PciAddress) -> Self {
        Self {
            trtype: TransportType::Pcie,
            pci_addr,
            traddr: pci_addr.to_string(),
        }
    }

    /// Parse from string (SPDK format).
    ///
    /// Format: `trtype=<type> traddr=<address>`; `:` is accepted in place
    /// of `=`. The address is normalized to `dddd:bb:dd.f`.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = |why: &str| Error::InvalidTransportId(format!("{why}: '{s}'"));

        let mut trtype = None;
        let mut traddr = None;

        for pair in s.split_whitespace() {
            let sep = pair.find(['=', ':']).ok_or_else(|| invalid("expected key=value"))?;
            let (key, value) = (&pair[..sep], &pair[sep + 1..]);
            if value.is_empty() {
                return Err(invalid("empty value"));
            }

            let slot = match key.to_ascii_lowercase().as_str() {
                "trtype" => &mut trtype,
                "traddr" => &mut traddr,
                _ => return Err(invalid("unknown key")),
            };
            if slot.replace(value).is_some() {
                return Err(invalid("duplicate key"));
            }
        }

        let trtype = trtype.ok_or_else(|| invalid("missing trtype"))?;
        let traddr = traddr.ok_or_else(|| invalid("missing traddr"))?;

        match TransportType::from_name(trtype) {
            Some(TransportType::Pcie) => {}
            Some(other) => return Err(Error::UnsupportedTransport(other.to_string())),
            None => return Err(invalid("unknown transport type")),
        }

        Self::pcie(traddr)
    }

    /// Get the transport type.
    pub fn transport_type(&self) -> TransportType {
        self.trtype
    }

    /// Get the normalized address.
    pub fn address(&self) -> &str {
        &self.traddr
    }

    /// Get the parsed PCI address.
    pub fn pci_address(&self) -> PciAddress {
        self.pci_addr
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "trtype:{} traddr:{}", self.trtype, self.traddr)
    }
}

impl FromStr for TransportId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_parse_pcie() {
        let trid = TransportId::parse("trtype=PCIE traddr=0000:01:00.0").unwrap();
        assert_eq!(trid.transport_type(), TransportType::Pcie);
        assert_eq!(trid.address(), "0000:01:00.0");
        assert_eq!(
            trid.pci_address(),
            PciAddress {
                domain: 0,
                bus: 1,
                dev: 0,
                func: 0
            }
        );
    }

    #[test]
    fn test_parse_spdk_colon_form() {
        let trid = TransportId::parse("trtype:PCIe traddr:0000:00:04.0").unwrap();
        assert_eq!(trid.address(), "0000:00:04.0");
        assert_eq!(trid.to_string(), "trtype:PCIe traddr:0000:00:04.0");
    }

    #[test]
    fn test_address_is_normalized() {
        let trid = TransportId::parse("TRTYPE=pcie  TRADDR=0000.5E.1F.7").unwrap();
        assert_eq!(trid.address(), "0000:5e:1f.7");

        let trid = TransportId::parse("trtype=PCIe traddr=3b:00.0").unwrap();
        assert_eq!(trid.address(), "0000:3b:00.0");
    }

    #[test]
    fn test_unsupported_transport() {
        let err = TransportId::parse("trtype=TCP traddr=0000:01:00.0").unwrap_err();
        assert!(matches!(err, Error::UnsupportedTransport(ref t) if t == "TCP"));
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_malformed_identifiers() {
        for s in [
            "",
            "trtype=PCIE",
            "traddr=0000:01:00.0",
            "trtype=PCIE traddr=",
            "trtype=PCIE traddr=0000:01:00.0 trtype=PCIE",
            "trtype=PCIE traddr=0000:01:00.0 subnqn=nqn.x",
            "trtype=FOO traddr=0000:01:00.0",
            "PCIE 0000:01:00.0",
        ] {
            let err = TransportId::parse(s).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Configuration, "{s:?} -> {err}");
        }
    }

    #[test]
    fn test_bad_pci_addresses() {
        for addr in [
            "0000:01:00",
            "0000:01:20.0",
            "0000:01:00.8",
            "0000:100:00.0",
            "zz:00.0",
            "0000:+1:00.0",
            "0000::00.0",
            "1.2.3",
            "not-an-address",
        ] {
            assert!(
                matches!(PciAddress::parse(addr), Err(Error::InvalidPciAddress(_))),
                "{addr} should be rejected"
            );
        }
    }
}
