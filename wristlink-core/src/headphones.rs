//! Headphone family session: sequence tracking, acknowledgements and
//! battery reporting on top of the packet codec.

use crate::events::DeviceEvent;
use tracing::{debug, warn};
use wristlink_protocol::headphones::{
    battery_request, parse_battery, BatteryType, MessageType, Packet, PacketDecoder,
};

/// Packets to write and events to emit after feeding bytes.
#[derive(Debug, Default)]
pub struct HeadphoneOutput {
    pub packets: Vec<Packet>,
    pub events: Vec<DeviceEvent>,
}

#[derive(Debug, Default)]
pub struct HeadphoneSession {
    decoder: PacketDecoder,
    sequence: u8,
}

impl HeadphoneSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number used for the next command.
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Builds a battery level request with the current sequence number.
    pub fn request_battery(&self, battery_type: BatteryType) -> Packet {
        let mut packet = battery_request(battery_type);
        packet.sequence = self.sequence;
        packet
    }

    /// Feeds received bytes; complete packets are handled in order.
    pub fn feed(&mut self, data: &[u8]) -> HeadphoneOutput {
        let mut out = HeadphoneOutput::default();
        self.decoder.extend(data);
        while let Some(result) = self.decoder.decode_packet() {
            match result {
                Ok(packet) => self.handle_packet(&packet, &mut out),
                Err(e) => warn!("Dropping headphone packet: {}", e),
            }
        }
        out
    }

    fn handle_packet(&mut self, packet: &Packet, out: &mut HeadphoneOutput) {
        match packet.message_type {
            MessageType::Ack => {
                self.sequence = packet.sequence;
            }
            MessageType::Command1 | MessageType::Command2 => {
                out.packets.push(Packet::ack(1u8.wrapping_sub(packet.sequence)));
                match parse_battery(&packet.payload) {
                    Ok(Some(levels)) => out.events.push(DeviceEvent::BatteryInfo { levels }),
                    Ok(None) => debug!(
                        "Unhandled headphone command {:02x?}",
                        packet.payload.first()
                    ),
                    Err(e) => warn!("Bad battery payload: {}", e),
                }
            }
            MessageType::Unknown(t) => {
                debug!("Unknown headphone packet type {:#04x}", t);
            }
        }
    }
}
