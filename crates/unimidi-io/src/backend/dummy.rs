//! Backend with no ports. Always available, so an API can always be resolved.

use super::{Backend, Capabilities, OpenOptions, OpenPortId, RawData, RawPacket, ReceiveCallback};
use unimidi_core::{Api, Direction, Error, PortHandle, Result};

#[derive(Debug, Default, Clone, Copy)]
pub struct DummyBackend;

impl DummyBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for DummyBackend {
    fn api(&self) -> Api {
        Api::Dummy
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    fn list_ports(&self, _direction: Direction) -> Result<Vec<PortHandle>> {
        Ok(Vec::new())
    }

    fn open(&self, port: &PortHandle, _options: &OpenOptions) -> Result<OpenPortId> {
        Err(Error::PortUnavailable(port.display_name().to_string()))
    }

    fn close(&self, _id: OpenPortId) -> Result<()> {
        Ok(())
    }

    fn send(&self, _id: OpenPortId, _data: RawData<'_>) -> Result<()> {
        Err(Error::NotOpen)
    }

    fn set_receive_callback(&self, _id: OpenPortId, _callback: ReceiveCallback) -> Result<()> {
        Err(Error::NotOpen)
    }

    fn poll(&self, _id: OpenPortId) -> Result<Option<RawPacket>> {
        Err(Error::NotOpen)
    }
}
