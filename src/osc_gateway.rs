//! Component H — OSC Gateway (spec §4.8).
//!
//! Bridges the internal message format to wire-compatible OSC frames using
//! `rosc`, the way the teacher's `protocol/osc.rs` `OSCOut` does for its
//! outbound path. Inbound and outbound are both UDP; bundle timestamps on
//! the inbound side become internal timestamps, per spec.

use std::net::{SocketAddr, UdpSocket};

use rosc::{OscBundle, OscMessage, OscPacket, OscTime, OscType};

use crate::error::RuntimeError;
use crate::message::{Arg, Message, MessageBuilder, Timestamp};

fn arg_to_osc(arg: &Arg) -> Option<OscType> {
    match arg {
        Arg::Int(v) => Some(OscType::Int(*v)),
        Arg::Long(v) => Some(OscType::Long(*v)),
        Arg::Float(v) => Some(OscType::Float(*v)),
        Arg::Double(v) => Some(OscType::Double(*v)),
        Arg::Time(v) => Some(OscType::Time(osc_time_from_seconds(*v))),
        Arg::Str(v) => Some(OscType::String(v.clone())),
        Arg::Symbol(v) => Some(OscType::String(v.clone())),
        Arg::Char(v) => Some(OscType::Char(*v)),
        Arg::Midi(v) => Some(OscType::Midi(rosc::OscMidiMessage {
            port: v[0],
            status: v[1],
            data1: v[2],
            data2: v[3],
        })),
        Arg::Blob(v) => Some(OscType::Blob(v.clone())),
        Arg::True => Some(OscType::Bool(true)),
        Arg::False => Some(OscType::Bool(false)),
        Arg::Bool(v) => Some(OscType::Bool(*v)),
        Arg::Nil => Some(OscType::Nil),
        Arg::Infinitum => Some(OscType::Inf),
    }
}

fn osc_to_arg(value: OscType) -> Option<Arg> {
    match value {
        OscType::Int(v) => Some(Arg::Int(v)),
        OscType::Long(v) => Some(Arg::Long(v)),
        OscType::Float(v) => Some(Arg::Float(v)),
        OscType::Double(v) => Some(Arg::Double(v)),
        OscType::Time(t) => Some(Arg::Time(osc_time_to_seconds(t))),
        OscType::String(s) => Some(Arg::Str(s)),
        OscType::Char(c) => Some(Arg::Char(c)),
        OscType::Midi(m) => Some(Arg::Midi([m.port, m.status, m.data1, m.data2])),
        OscType::Blob(b) => Some(Arg::Blob(b)),
        OscType::Bool(true) => Some(Arg::True),
        OscType::Bool(false) => Some(Arg::False),
        OscType::Nil => Some(Arg::Nil),
        OscType::Inf => Some(Arg::Infinitum),
        OscType::Array(_) | OscType::Color(_) => None,
    }
}

const NTP_UNIX_OFFSET_SECS: f64 = 2_208_988_800.0;

fn osc_time_from_seconds(unix_seconds: f64) -> OscTime {
    let ntp = unix_seconds + NTP_UNIX_OFFSET_SECS;
    let seconds = ntp.floor();
    let fractional = ((ntp - seconds) * (1u64 << 32) as f64) as u32;
    OscTime { seconds: seconds as u32, fractional }
}

fn osc_time_to_seconds(t: OscTime) -> Timestamp {
    t.seconds as f64 + (t.fractional as f64 / (1u64 << 32) as f64) - NTP_UNIX_OFFSET_SECS
}

/// Flattens a (possibly nested) OSC packet into internal messages with
/// address prefixed by the owning service, unbundling recursively and
/// carrying the bundle timetag as the internal timestamp.
fn flatten(packet: OscPacket, service: &str, default_time: Timestamp) -> Vec<Message> {
    match packet {
        OscPacket::Message(m) => {
            let mut builder = MessageBuilder::new();
            for arg in m.args {
                let Some(arg) = osc_to_arg(arg) else { continue };
                builder = builder.add_arg(arg);
            }
            let addr = format!("/{service}{}", m.addr);
            match builder.seal(default_time, addr) {
                Ok(msg) => vec![msg],
                Err(_) => Vec::new(),
            }
        }
        OscPacket::Bundle(OscBundle { timetag, content }) => {
            let time = osc_time_to_seconds(timetag);
            content.into_iter().flat_map(|p| flatten(p, service, time)).collect()
        }
    }
}

/// One inbound OSC receiver, bound to a service name.
pub struct OscInbound {
    pub service: String,
    socket: UdpSocket,
}

impl OscInbound {
    pub fn bind(service: impl Into<String>, port: u16, udp: bool) -> Result<Self, RuntimeError> {
        if !udp {
            return Err(RuntimeError::State("only UDP inbound OSC ports are supported".into()));
        }
        let socket = UdpSocket::bind(("0.0.0.0", port)).map_err(RuntimeError::from)?;
        socket.set_nonblocking(true).map_err(RuntimeError::from)?;
        Ok(OscInbound { service: service.into(), socket })
    }

    /// Drains pending datagrams, decoding each as OSC and unbundling it into
    /// internal messages addressed under this service. Malformed frames are
    /// counted and dropped (spec §4.8), not propagated as an error.
    pub fn poll(&self, now: Timestamp, malformed_count: &mut u64) -> Vec<Message> {
        let mut out = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((n, _from)) => match rosc::decoder::decode_udp(&buf[..n]) {
                    Ok((_, packet)) => out.extend(flatten(packet, &self.service, now)),
                    Err(_) => *malformed_count += 1,
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        out
    }
}

/// One outbound OSC delegate: messages addressed to `/service/...` are
/// translated and forwarded here instead of being dispatched locally.
pub struct OscOutbound {
    pub addr: SocketAddr,
    socket: UdpSocket,
}

impl OscOutbound {
    pub fn connect(addr: SocketAddr) -> Result<Self, RuntimeError> {
        let socket = UdpSocket::bind("0.0.0.0:0").map_err(RuntimeError::from)?;
        Ok(OscOutbound { addr, socket })
    }

    /// Sends `message` (with the leading `/service` segment already
    /// stripped by the caller) as a plain OSC message, or — if `message`
    /// carries a positive timestamp — as a single-element bundle with that
    /// timestamp as the OSC timetag.
    pub fn send(&self, address: &str, message: &Message) -> Result<(), RuntimeError> {
        let args: Vec<OscType> = message.args.iter().filter_map(arg_to_osc).collect();
        let osc_message = OscMessage { addr: address.to_string(), args };
        let packet = if message.timestamp > 0.0 {
            OscPacket::Bundle(OscBundle {
                timetag: osc_time_from_seconds(message.timestamp),
                content: vec![OscPacket::Message(osc_message)],
            })
        } else {
            OscPacket::Message(osc_message)
        };
        let buf = rosc::encoder::encode(&packet).map_err(RuntimeError::from)?;
        self.socket.send_to(&buf, self.addr).map_err(RuntimeError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_int_through_osc_type() {
        let arg = Arg::Int(7);
        let osc = arg_to_osc(&arg).unwrap();
        assert_eq!(osc_to_arg(osc), Some(Arg::Int(7)));
    }

    #[test]
    fn bundle_timetag_becomes_internal_timestamp() {
        let inner = OscMessage { addr: "/ping".to_string(), args: vec![OscType::Int(7)] };
        let bundle = OscPacket::Bundle(OscBundle {
            timetag: osc_time_from_seconds(100.0),
            content: vec![OscPacket::Message(inner)],
        });
        let messages = flatten(bundle, "osc_in", 0.0);
        assert_eq!(messages.len(), 1);
        assert!((messages[0].timestamp - 100.0).abs() < 0.001);
        assert_eq!(messages[0].path(), "osc_in/ping");
    }
}
