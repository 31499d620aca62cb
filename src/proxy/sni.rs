/// TLS ClientHello inspection for the transparent HTTPS listener. The bytes
/// are parsed without being consumed from the connection; the caller replays
/// them afterwards.

const RECORD_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST: u8 = 0x00;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientHelloParse {
    /// server_name extension found.
    Sni(String),
    /// A complete ClientHello without a usable server_name entry.
    NoSni,
    /// Prefix looks like TLS but the handshake is not complete yet.
    NeedMoreData,
    /// The bytes are not a TLS handshake.
    NotTls,
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

struct Incomplete;

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Incomplete> {
        if self.pos + n > self.buf.len() {
            return Err(Incomplete);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, Incomplete> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, Incomplete> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<u32, Incomplete> {
        let b = self.take(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

/// Reassembles the handshake payload from consecutive handshake records.
fn handshake_payload(buf: &[u8]) -> Result<Vec<u8>, ClientHelloParse> {
    let mut payload = Vec::new();
    let mut pos = 0usize;
    loop {
        if buf.len() - pos < 5 {
            if payload.is_empty() {
                return Err(ClientHelloParse::NeedMoreData);
            }
            return Ok(payload);
        }
        let header = &buf[pos..pos + 5];
        if header[0] != RECORD_HANDSHAKE || header[1] != 0x03 {
            if payload.is_empty() {
                return Err(ClientHelloParse::NotTls);
            }
            return Ok(payload);
        }
        let len = u16::from_be_bytes([header[3], header[4]]) as usize;
        if buf.len() - pos - 5 < len {
            // Partial record: keep what we have, the caller decides whether
            // enough of the ClientHello arrived.
            payload.extend_from_slice(&buf[pos + 5..]);
            return Ok(payload);
        }
        payload.extend_from_slice(&buf[pos + 5..pos + 5 + len]);
        pos += 5 + len;
    }
}

/// Parses the server_name extension out of a (possibly partial) ClientHello.
pub fn parse_client_hello(buf: &[u8]) -> ClientHelloParse {
    let payload = match handshake_payload(buf) {
        Ok(p) => p,
        Err(outcome) => return outcome,
    };

    let mut r = Reader::new(&payload);
    let Ok(msg_type) = r.u8() else {
        return ClientHelloParse::NeedMoreData;
    };
    if msg_type != HANDSHAKE_CLIENT_HELLO {
        return ClientHelloParse::NotTls;
    }
    let Ok(msg_len) = r.u24() else {
        return ClientHelloParse::NeedMoreData;
    };
    if (msg_len as usize) > r.remaining() {
        return ClientHelloParse::NeedMoreData;
    }

    let body = |r: &mut Reader| -> Result<ClientHelloParse, Incomplete> {
        r.take(2)?; // legacy_version
        r.take(32)?; // random
        let session_len = r.u8()? as usize;
        r.take(session_len)?;
        let ciphers_len = r.u16()? as usize;
        r.take(ciphers_len)?;
        let compression_len = r.u8()? as usize;
        r.take(compression_len)?;
        if r.remaining() < 2 {
            // Legal ClientHello without extensions.
            return Ok(ClientHelloParse::NoSni);
        }
        let ext_total = r.u16()? as usize;
        let ext_block = r.take(ext_total)?;
        let mut er = Reader::new(ext_block);
        while er.remaining() >= 4 {
            let ext_type = er.u16()?;
            let ext_len = er.u16()? as usize;
            let data = er.take(ext_len)?;
            if ext_type != EXTENSION_SERVER_NAME {
                continue;
            }
            let mut nr = Reader::new(data);
            let list_len = nr.u16()? as usize;
            let list = nr.take(list_len)?;
            let mut lr = Reader::new(list);
            while lr.remaining() >= 3 {
                let name_type = lr.u8()?;
                let name_len = lr.u16()? as usize;
                let name = lr.take(name_len)?;
                if name_type == NAME_TYPE_HOST && !name.is_empty() {
                    let host = String::from_utf8_lossy(name).to_ascii_lowercase();
                    return Ok(ClientHelloParse::Sni(host));
                }
            }
            return Ok(ClientHelloParse::NoSni);
        }
        Ok(ClientHelloParse::NoSni)
    };
    match body(&mut r) {
        Ok(outcome) => outcome,
        // A declared length ran past the reassembled payload: the record
        // stream is still arriving.
        Err(Incomplete) => ClientHelloParse::NeedMoreData,
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::{client_hello, sni_extension};
    use super::*;

    #[test]
    fn extracts_sni_host_name() {
        let hello = client_hello(&sni_extension("Example.COM"));
        assert_eq!(
            parse_client_hello(&hello),
            ClientHelloParse::Sni("example.com".into())
        );
    }

    #[test]
    fn hello_without_sni_reports_no_sni() {
        let hello = client_hello(&[]);
        assert_eq!(parse_client_hello(&hello), ClientHelloParse::NoSni);
    }

    #[test]
    fn non_tls_bytes_are_rejected() {
        assert_eq!(
            parse_client_hello(b"GET / HTTP/1.1\r\n\r\n"),
            ClientHelloParse::NotTls
        );
        assert_eq!(parse_client_hello(&[0x16, 0x99, 0x00]), ClientHelloParse::NeedMoreData);
        assert_eq!(
            parse_client_hello(&[0x16, 0x99, 0x01, 0x00, 0x00]),
            ClientHelloParse::NotTls
        );
    }

    #[test]
    fn truncated_hello_wants_more_data() {
        let hello = client_hello(&sni_extension("example.com"));
        for cut in [3, 8, hello.len() - 1] {
            assert_eq!(
                parse_client_hello(&hello[..cut]),
                ClientHelloParse::NeedMoreData,
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn hello_split_across_two_records_is_reassembled() {
        let single = client_hello(&sni_extension("split.example"));
        let handshake = &single[5..];
        let (a, b) = handshake.split_at(20);
        let mut wire = vec![RECORD_HANDSHAKE, 0x03, 0x01];
        wire.extend_from_slice(&(a.len() as u16).to_be_bytes());
        wire.extend_from_slice(a);
        wire.extend_from_slice(&[RECORD_HANDSHAKE, 0x03, 0x01]);
        wire.extend_from_slice(&(b.len() as u16).to_be_bytes());
        wire.extend_from_slice(b);
        assert_eq!(
            parse_client_hello(&wire),
            ClientHelloParse::Sni("split.example".into())
        );
    }
}
