//! Platform-specific management providers
//!
//! [`SystemProvider`] attaches to processes on the local machine and opens
//! their endpoints by scheme. The in-memory host in [`memory`] is available
//! everywhere.

use crate::core::{ChannelProvider, EndpointAddress, Error, ManagementChannel, ProcessAttacher, Result};

#[cfg(target_os = "linux")]
pub mod linux;

pub mod memory;

/// Attacher and channel provider for local processes
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider;

impl ProcessAttacher for SystemProvider {
    fn published_address(&self, pid: u32) -> Result<Option<EndpointAddress>> {
        #[cfg(target_os = "linux")]
        {
            linux::ProcfsAttacher.published_address(pid)
        }
        #[cfg(not(target_os = "linux"))]
        {
            Err(Error::Attach {
                pid,
                message: "no process attacher for this platform".into(),
            })
        }
    }

    fn bootstrap_management_agent(&self, pid: u32) -> Result<()> {
        #[cfg(target_os = "linux")]
        {
            linux::ProcfsAttacher.bootstrap_management_agent(pid)
        }
        #[cfg(not(target_os = "linux"))]
        {
            Err(Error::Attach {
                pid,
                message: "no process attacher for this platform".into(),
            })
        }
    }
}

impl ChannelProvider for SystemProvider {
    fn open(&self, address: &EndpointAddress) -> Result<Box<dyn ManagementChannel>> {
        match address.scheme() {
            #[cfg(target_os = "linux")]
            linux::PROCFS_SCHEME => linux::open_channel(address),
            scheme => Err(Error::connection(format!(
                "no channel provider for scheme `{}` ({})",
                scheme, address
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_scheme_is_connection_error() {
        let address = EndpointAddress::new("jmxrmi", "localhost:9010");
        assert!(matches!(
            SystemProvider.open(&address),
            Err(Error::Connection(_))
        ));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_system_provider_opens_own_process() {
        let address = crate::core::resolve_endpoint(&SystemProvider, std::process::id()).unwrap();
        assert_eq!(address.scheme(), linux::PROCFS_SCHEME);
        let channel = SystemProvider.open(&address).unwrap();
        channel.close().unwrap();
    }
}
