//! Probe datagrams asking a source about a file.
//!
//! A [`HeadPing`] asks whether the host has the file, how busy it is and
//! which other sources it knows. The answer is a [`HeadPong`]. Firewalled
//! hosts are probed through their push proxies, the ping then carries the
//! guid of the host it is meant for.
//!
//! One datagram holds one message:
//!
//! <id=u8><speedy payload>
use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, BytesMut};
use speedy::{BigEndian, Readable, Writable};
use tokio::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    host::{Guid, HostContext, Urn},
    interval::Interval,
};

/// Socket address as sent on the wire, IPv4 is mapped into IPv6.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Readable, Writable)]
pub struct WireAddr {
    pub ip: [u8; 16],
    pub port: u16,
}

impl From<SocketAddr> for WireAddr {
    fn from(value: SocketAddr) -> Self {
        let ip = match value.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Self {
            ip: ip.octets(),
            port: value.port(),
        }
    }
}

impl From<WireAddr> for SocketAddr {
    fn from(value: WireAddr) -> Self {
        let ip = Ipv6Addr::from(value.ip).to_canonical();
        SocketAddr::new(ip, value.port)
    }
}

/// A firewalled source and the proxies it can be reached through.
#[derive(Clone, Debug, PartialEq, Eq, Readable, Writable)]
pub struct PushLocation {
    pub guid: Guid,
    pub proxies: Vec<WireAddr>,
    /// Address for firewall to firewall transfers, if supported.
    pub fwt: Option<WireAddr>,
}

#[derive(Clone, Debug, PartialEq, Eq, Readable, Writable)]
pub struct HeadPing {
    /// Guid of the pinging client.
    pub guid: Guid,
    pub urn: Urn,
    /// Set when the ping goes through a push proxy, the host it is for.
    pub client_guid: Option<Guid>,
    pub flags: u8,
}

impl HeadPing {
    /// Ask for the ranges the host has.
    pub const RANGES: u8 = 0x1;
    /// Ask for other direct sources.
    pub const ALT_LOCS: u8 = 0x2;
    /// Ask for other firewalled sources.
    pub const PUSH_ALT_LOCS: u8 = 0x4;

    pub fn wants(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Readable, Writable)]
pub struct HeadPong {
    pub has_file: bool,
    /// The host has the whole file, `ranges` is then empty.
    pub complete: bool,
    /// Negative values are free slots, positive ones a queue position.
    pub queue_status: i32,
    pub firewalled: bool,
    pub busy: bool,
    pub ranges: Vec<Interval>,
    pub alt_locs: Vec<WireAddr>,
    pub push_locs: Vec<PushLocation>,
}

impl HeadPong {
    pub fn no_file() -> Self {
        Self::default()
    }

    /// Sources described by this pong, as learned from `from`.
    pub fn alternate_sources(&self, from: &HostContext) -> Vec<HostContext> {
        let direct = self.alt_locs.iter().map(|addr| {
            let mut host =
                HostContext::new((*addr).into(), from.urn, from.file_size);
            host.from_alt_location = true;
            host
        });
        let pushed = self.push_locs.iter().map(|loc| {
            let addr = loc
                .fwt
                .map(SocketAddr::from)
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
            let mut host = HostContext::firewalled(
                loc.guid,
                addr,
                loc.proxies.iter().map(|p| (*p).into()).collect(),
                from.urn,
                from.file_size,
            );
            host.fwt_capable = loc.fwt.is_some();
            host.from_alt_location = true;
            host
        });
        direct.chain(pushed).collect()
    }

    /// Ranges, dropping malformed ones.
    pub fn valid_ranges(&self) -> impl Iterator<Item = Interval> + '_ {
        self.ranges
            .iter()
            .filter_map(|r| Interval::checked(r.low(), r.high()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeMsg {
    Ping(HeadPing),
    Pong(HeadPong),
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ProbeId {
    Ping = 1,
    Pong = 2,
}

impl TryFrom<u8> for ProbeId {
    type Error = io::Error;

    fn try_from(k: u8) -> Result<Self, Self::Error> {
        use ProbeId::*;
        match k {
            k if k == Ping as u8 => Ok(Ping),
            k if k == Pong as u8 => Ok(Pong),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Unknown probe id",
            )),
        }
    }
}

/// Codec of probe datagrams, for `tokio_util::udp::UdpFramed`.
#[derive(Debug, Default)]
pub struct ProbeCodec;

impl Encoder<ProbeMsg> for ProbeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        item: ProbeMsg,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        let (id, payload) = match item {
            ProbeMsg::Ping(ping) => {
                (ProbeId::Ping, ping.write_to_vec_with_ctx(BigEndian {}))
            }
            ProbeMsg::Pong(pong) => {
                (ProbeId::Pong, pong.write_to_vec_with_ctx(BigEndian {}))
            }
        };
        let payload = payload
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        buf.put_u8(id as u8);
        buf.extend_from_slice(&payload);
        Ok(())
    }
}

impl Decoder for ProbeCodec {
    type Item = ProbeMsg;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        // a datagram is a whole message
        let id = ProbeId::try_from(buf.get_u8());
        let payload = buf.split();
        let invalid = |e: speedy::Error| io::Error::new(io::ErrorKind::InvalidData, e);

        let msg = match id? {
            ProbeId::Ping => ProbeMsg::Ping(
                HeadPing::read_from_buffer_with_ctx(BigEndian {}, &payload)
                    .map_err(invalid)?,
            ),
            ProbeId::Pong => ProbeMsg::Pong(
                HeadPong::read_from_buffer_with_ctx(BigEndian {}, &payload)
                    .map_err(invalid)?,
            ),
        };
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pong_survives_the_codec() {
        let pong = HeadPong {
            has_file: true,
            complete: false,
            queue_status: -3,
            firewalled: false,
            busy: false,
            ranges: vec![Interval::new(0, 99), Interval::new(200, 299)],
            alt_locs: vec!["10.0.0.1:6346".parse::<SocketAddr>().unwrap().into()],
            push_locs: vec![PushLocation {
                guid: Guid([9; 16]),
                proxies: vec!["10.0.0.2:6346".parse::<SocketAddr>().unwrap().into()],
                fwt: None,
            }],
        };

        let mut buf = BytesMut::new();
        ProbeCodec.encode(ProbeMsg::Pong(pong.clone()), &mut buf).unwrap();
        assert_eq!(buf[0], ProbeId::Pong as u8);

        let decoded = ProbeCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, ProbeMsg::Pong(pong));
        assert!(buf.is_empty());
    }

    #[test]
    fn rejects_garbage() {
        let mut buf = BytesMut::from(&[7u8, 1, 2, 3][..]);
        assert!(ProbeCodec.decode(&mut buf).is_err());

        let mut buf = BytesMut::from(&[ProbeId::Ping as u8, 1][..]);
        assert!(ProbeCodec.decode(&mut buf).is_err());

        let mut buf = BytesMut::new();
        assert!(ProbeCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn v4_addresses_come_back_as_v4() {
        let addr: SocketAddr = "192.168.1.7:4000".parse().unwrap();
        let wire = WireAddr::from(addr);
        assert_eq!(SocketAddr::from(wire), addr);
    }

    #[test]
    fn alternate_sources_inherit_the_file() {
        let origin = HostContext::new(
            "1.1.1.1:1".parse().unwrap(),
            Some(Urn([3; 20])),
            500,
        );
        let pong = HeadPong {
            has_file: true,
            complete: true,
            alt_locs: vec!["2.2.2.2:2".parse::<SocketAddr>().unwrap().into()],
            push_locs: vec![PushLocation {
                guid: Guid([1; 16]),
                proxies: vec![],
                fwt: Some("3.3.3.3:3".parse::<SocketAddr>().unwrap().into()),
            }],
            ..Default::default()
        };

        let alts = pong.alternate_sources(&origin);
        assert_eq!(alts.len(), 2);
        assert!(alts.iter().all(|h| h.urn == origin.urn && h.from_alt_location));
        assert!(!alts[0].firewalled);
        assert!(alts[1].firewalled && alts[1].fwt_capable);
    }
}
