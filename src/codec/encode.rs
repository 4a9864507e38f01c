//! MQTT Packet Encoder
//!
//! Encodes MQTT v3.1 / v3.1.1 packets

use bytes::{BufMut, BytesMut};

use super::{write_binary, write_string, write_variable_int};
use crate::protocol::{
    ConnAck, Connect, EncodeError, Packet, ProtocolVersion, Publish, QoS, SubAck, Subscribe,
    Unsubscribe,
};

/// MQTT Packet Encoder
#[derive(Debug, Clone, Copy)]
pub struct Encoder {
    protocol_version: ProtocolVersion,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(ProtocolVersion::V311)
    }
}

impl Encoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            protocol_version: version,
        }
    }

    pub fn set_protocol_version(&mut self, version: ProtocolVersion) {
        self.protocol_version = version;
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => encode_connect(p, buf),
            Packet::ConnAck(p) => self.encode_connack(p, buf),
            Packet::Publish(p) => encode_publish(p, buf),
            Packet::PubAck(p) => encode_packet_id(0x40, p.packet_id, buf),
            Packet::PubRec(p) => encode_packet_id(0x50, p.0, buf),
            Packet::PubRel(p) => encode_packet_id(0x62, p.0, buf),
            Packet::PubComp(p) => encode_packet_id(0x70, p.0, buf),
            Packet::Subscribe(p) => encode_subscribe(p, buf),
            Packet::SubAck(p) => encode_suback(p, buf),
            Packet::Unsubscribe(p) => encode_unsubscribe(p, buf),
            Packet::UnsubAck(p) => encode_packet_id(0xB0, p.packet_id, buf),
            Packet::PingReq => {
                buf.put_u8(0xC0);
                buf.put_u8(0x00);
                Ok(())
            }
            Packet::PingResp => {
                buf.put_u8(0xD0);
                buf.put_u8(0x00);
                Ok(())
            }
            Packet::Disconnect => {
                buf.put_u8(0xE0);
                buf.put_u8(0x00);
                Ok(())
            }
        }
    }

    fn encode_connack(&self, packet: &ConnAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(0x20);
        buf.put_u8(0x02);

        // Session present is undefined in v3.1 and must be sent as 0
        let session_present =
            packet.session_present && self.protocol_version == ProtocolVersion::V311;
        buf.put_u8(session_present as u8);
        buf.put_u8(packet.return_code as u8);
        Ok(())
    }
}

fn encode_packet_id(header: u8, packet_id: u16, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(header);
    buf.put_u8(0x02);
    buf.put_u16(packet_id);
    Ok(())
}

fn encode_connect(packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let protocol_name = packet.protocol_version.protocol_name();

    // Protocol name, level, flags, keep alive
    let mut remaining_length = 2 + protocol_name.len() + 1 + 1 + 2;
    remaining_length += 2 + packet.client_id.len();
    if let Some(ref will) = packet.will {
        remaining_length += 2 + will.topic.len() + 2 + will.payload.len();
    }
    if let Some(ref username) = packet.username {
        remaining_length += 2 + username.len();
    }
    if let Some(ref password) = packet.password {
        remaining_length += 2 + password.len();
    }

    buf.put_u8(0x10);
    write_variable_int(buf, remaining_length as u32)?;

    write_string(buf, protocol_name)?;
    buf.put_u8(packet.protocol_version as u8);

    let mut connect_flags: u8 = 0;
    if packet.clean_session {
        connect_flags |= 0x02;
    }
    if let Some(ref will) = packet.will {
        connect_flags |= 0x04;
        connect_flags |= (will.qos as u8) << 3;
        if will.retain {
            connect_flags |= 0x20;
        }
    }
    if packet.password.is_some() {
        connect_flags |= 0x40;
    }
    if packet.username.is_some() {
        connect_flags |= 0x80;
    }
    buf.put_u8(connect_flags);
    buf.put_u16(packet.keep_alive);

    write_string(buf, &packet.client_id)?;
    if let Some(ref will) = packet.will {
        write_string(buf, &will.topic)?;
        write_binary(buf, &will.payload)?;
    }
    if let Some(ref username) = packet.username {
        write_string(buf, username)?;
    }
    if let Some(ref password) = packet.password {
        write_binary(buf, password)?;
    }

    Ok(())
}

fn encode_publish(packet: &Publish, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let mut remaining_length = 2 + packet.topic.len() + packet.payload.len();
    if packet.qos != QoS::AtMostOnce {
        remaining_length += 2;
    }

    let mut header = 0x30 | ((packet.qos as u8) << 1);
    if packet.dup {
        header |= 0x08;
    }
    if packet.retain {
        header |= 0x01;
    }
    buf.put_u8(header);
    write_variable_int(buf, remaining_length as u32)?;

    write_string(buf, &packet.topic)?;
    if packet.qos != QoS::AtMostOnce {
        buf.put_u16(packet.packet_id.unwrap_or(0));
    }
    buf.put_slice(&packet.payload);

    Ok(())
}

fn encode_subscribe(packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let remaining_length = 2 + packet
        .filters
        .iter()
        .map(|f| 2 + f.filter.len() + 1)
        .sum::<usize>();

    buf.put_u8(0x82);
    write_variable_int(buf, remaining_length as u32)?;
    buf.put_u16(packet.packet_id);
    for f in &packet.filters {
        write_string(buf, &f.filter)?;
        buf.put_u8(f.qos as u8);
    }
    Ok(())
}

fn encode_suback(packet: &SubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
    buf.put_u8(0x90);
    write_variable_int(buf, (2 + packet.return_codes.len()) as u32)?;
    buf.put_u16(packet.packet_id);
    for code in &packet.return_codes {
        buf.put_u8(*code as u8);
    }
    Ok(())
}

fn encode_unsubscribe(packet: &Unsubscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let remaining_length = 2 + packet.filters.iter().map(|f| 2 + f.len()).sum::<usize>();

    buf.put_u8(0xA2);
    write_variable_int(buf, remaining_length as u32)?;
    buf.put_u16(packet.packet_id);
    for filter in &packet.filters {
        write_string(buf, filter)?;
    }
    Ok(())
}
