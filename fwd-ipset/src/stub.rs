//! Stand-in for platforms without ipset.
//!
//! Every operation returns `Err(IpSetError::UnsupportedPlatform)`.

use std::net::IpAddr;

use crate::{validate_set_name, IpSetCreateOptions, IpSetError, Result, SetHeader};

/// ipset connection (stub for non-Linux)
pub struct IpsetConn {
    _private: (),
}

impl IpsetConn {
    pub fn open() -> Result<Self> {
        Err(IpSetError::UnsupportedPlatform)
    }

    pub fn header(&mut self, setname: &str) -> Result<SetHeader> {
        validate_set_name(setname)?;
        Err(IpSetError::UnsupportedPlatform)
    }

    pub fn add(&mut self, setname: &str, _ip: IpAddr) -> Result<()> {
        validate_set_name(setname)?;
        Err(IpSetError::UnsupportedPlatform)
    }

    pub fn test(&mut self, setname: &str, _ip: IpAddr) -> Result<bool> {
        validate_set_name(setname)?;
        Err(IpSetError::UnsupportedPlatform)
    }

    pub fn create(&mut self, setname: &str, _options: &IpSetCreateOptions) -> Result<()> {
        validate_set_name(setname)?;
        Err(IpSetError::UnsupportedPlatform)
    }

    pub fn destroy(&mut self, setname: &str) -> Result<()> {
        validate_set_name(setname)?;
        Err(IpSetError::UnsupportedPlatform)
    }
}
