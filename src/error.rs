use core::fmt::Debug;
use core::fmt::Display;

pub enum Error {
    PCap(pcap::Error),
    NoDeviceFound(String),
    UnsupportedLinkType(i32),
    ConfigIo(std::io::Error),
    ConfigParse(toml::de::Error),
}

impl core::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::PCap(e) => write!(f, "PCap error: {e:?}"),
            Error::NoDeviceFound(name) => write!(f, "No device found: {name}"),
            Error::UnsupportedLinkType(t) => write!(f, "Unsupported link type: {t}"),
            Error::ConfigIo(e) => write!(f, "Failed to read config: {e}"),
            Error::ConfigParse(e) => write!(f, "Failed to parse config: {e}"),
        }
    }
}

impl From<pcap::Error> for Error {
    fn from(e: pcap::Error) -> Self {
        Error::PCap(e)
    }
}
