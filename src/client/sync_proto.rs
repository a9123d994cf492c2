use std::{
    io::{self, Read, Write},
    net::{Ipv4Addr, Ipv6Addr},
};

use crate::proto::*;

pub trait Sendable {
    fn write_to<W: Write>(&self, conn: &mut W) -> io::Result<()>;
}

pub trait Receivable {
    fn read_from<R: Read>(conn: &mut R) -> io::Result<Self>
    where
        Self: Sized;
}

pub fn send_recv<C, Req, Resp>(conn: &mut C, msg_to_send: Req) -> io::Result<Resp>
where
    C: Read + Write,
    Req: Sendable,
    Resp: Receivable,
{
    msg_to_send.write_to(conn)?;
    Resp::read_from(conn)
}

fn expect_version(version: u8) -> io::Result<()> {
    if version != SOCKS_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected socks version: {SOCKS_VERSION}, got: {version}"),
        ));
    }
    Ok(())
}

impl Sendable for ClientGreeting {
    fn write_to<W: Write>(&self, conn: &mut W) -> io::Result<()> {
        let mut buf = Vec::with_capacity(1 + 1 + self.0.len());
        buf.push(SOCKS_VERSION);
        buf.push(self.0.len() as u8);
        buf.extend(self.0.iter().map(|&auth_method| auth_method as u8));
        conn.write_all(&buf)
    }
}

impl Receivable for ServerAuthChoice {
    fn read_from<R: Read>(conn: &mut R) -> io::Result<Self> {
        let mut buf = [0_u8; 2];
        conn.read_exact(&mut buf)?;
        expect_version(buf[0])?;
        if buf[1] == NO_ACCEPTABLE_METHODS {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "proxy accepted none of the offered auth methods",
            ));
        }
        Ok(Self(AuthMethod::try_from(buf[1])?))
    }
}

impl Receivable for Address {
    fn read_from<R: Read>(conn: &mut R) -> io::Result<Self> {
        let mut atyp = [0_u8; 1];
        conn.read_exact(&mut atyp)?;
        match atyp[0] {
            ATYP_IPV4 => {
                let mut buf = [0_u8; 4];
                conn.read_exact(&mut buf)?;
                Ok(Self::Ipv4(Ipv4Addr::from(buf)))
            }
            ATYP_DOMAIN_NAME => {
                let mut len = [0_u8; 1];
                conn.read_exact(&mut len)?;
                let mut buf = vec![0_u8; len[0] as usize];
                conn.read_exact(&mut buf)?;
                let dn = String::from_utf8(buf)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))?;
                Ok(Self::DomainName(dn))
            }
            ATYP_IPV6 => {
                let mut buf = [0_u8; 16];
                conn.read_exact(&mut buf)?;
                Ok(Self::Ipv6(Ipv6Addr::from(buf)))
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("failed to parse address. expected 0x01, 0x03, 0x04: got: {other:#04x}"),
            )),
        }
    }
}

impl Sendable for ClientConnectionRequest {
    fn write_to<W: Write>(&self, conn: &mut W) -> io::Result<()> {
        let mut buf = vec![SOCKS_VERSION, self.cmd as u8, RESERVED];
        buf.extend_from_slice(&self.destination.as_bytes());
        conn.write_all(&buf)
    }
}

impl Receivable for ServerResponse {
    fn read_from<R: Read>(conn: &mut R) -> io::Result<Self> {
        let mut buf = [0_u8; 3];
        conn.read_exact(&mut buf)?;
        expect_version(buf[0])?;
        let status = ServerStatus::try_from(buf[1])?;
        if buf[2] != RESERVED {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected RSV byte to be zero, got: {}", buf[2]),
            ));
        }

        let address = Address::read_from(conn)?;
        let mut port = [0_u8; 2];
        conn.read_exact(&mut port)?;

        Ok(Self {
            status,
            bound: Destination::new(address, u16::from_be_bytes(port)),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn greeting_encodes_every_method() {
        let mut out = Vec::new();
        ClientGreeting(vec![AuthMethod::NoAuth, AuthMethod::UserPass])
            .write_to(&mut out)
            .unwrap();
        assert_eq!(out, [0x05, 0x02, 0x00, 0x02]);
    }

    #[test]
    fn domain_request_encoding() {
        let mut out = Vec::new();
        ClientConnectionRequest {
            cmd: ClientCommand::EstablishConnection,
            destination: Destination::new(Address::DomainName("a.io".into()), 443),
        }
        .write_to(&mut out)
        .unwrap();
        assert_eq!(out, [0x05, 0x01, 0x00, 0x03, 4, b'a', b'.', b'i', b'o', 0x01, 0xbb]);
    }

    #[test]
    fn connect_ack_parses_as_granted() {
        let resp = ServerResponse::read_from(&mut Cursor::new(CONNECT_ACK)).unwrap();
        assert_eq!(resp.status, ServerStatus::RequestGranted);
        assert_eq!(resp.bound.to_string(), "0.0.0.0:4112");
    }

    #[test]
    fn refusal_is_permission_denied() {
        let err = ServerAuthChoice::read_from(&mut Cursor::new(AUTH_REJECTED)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn truncated_reply_is_an_error() {
        let err = ServerResponse::read_from(&mut Cursor::new(&CONNECT_ACK[..6])).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
