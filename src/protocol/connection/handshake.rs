use sha1::{Digest, Sha1};
use zerocopy::byteorder::little_endian::U16 as U16LE;
use zerocopy::{FromBytes, Immutable, KnownLayout};

use crate::constant::{CapabilityFlags, HANDSHAKE_CHARSET, LEGACY_MAX_PACKET_CHUNK, MAX_PACKET_CHUNK, ServerStatusFlags};
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::primitive::*;
use crate::protocol::response::{ERR_HEADER, ServerError};

/// `major.minor.patch` parsed from the greeting's version string
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl ServerVersion {
    /// Parse strings such as `4.1.22-log` or `5.0.96-community-nt`.
    pub fn parse(version: &str) -> Result<Self> {
        let mut parts = version.splitn(3, '.');
        let mut next = || -> Result<u16> {
            let part = parts
                .next()
                .ok_or_else(|| Error::protocol(format!("bad server version '{version}'")))?;
            let digits: String = part.chars().take_while(char::is_ascii_digit).collect();
            digits
                .parse()
                .map_err(|_| Error::protocol(format!("bad server version '{version}'")))
        };
        Ok(Self {
            major: next()?,
            minor: next()?,
            patch: next()?,
        })
    }

    pub fn is_at_least(&self, major: u16, minor: u16, patch: u16) -> bool {
        (self.major, self.minor, self.patch) >= (major, minor, patch)
    }

    /// Largest payload of a single packet
    pub fn max_single_packet(&self) -> usize {
        if self.is_at_least(4, 0, 8) {
            MAX_PACKET_CHUNK
        } else {
            LEGACY_MAX_PACKET_CHUNK
        }
    }

    /// OK/EOF packets carry status and warnings, column metadata uses the 4.1 layout
    pub fn has_protocol_41(&self) -> bool {
        self.is_at_least(4, 1, 0)
    }
}

/// Fields that follow the capability flags in a >= 4.1.1 greeting
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable)]
struct GreetingTail41 {
    language: u8,
    status_flags: U16LE,
    filler: [u8; 13],
}

/// Initial handshake packet sent by the server
#[derive(Debug, Clone, Default)]
pub struct Greeting {
    pub protocol_version: u8,
    pub server_version: String,
    pub version: ServerVersion,
    pub thread_id: u32,
    /// Auth seed, both parts concatenated for >= 4.1.1 servers
    pub seed: Vec<u8>,
    pub capabilities: CapabilityFlags,
    /// Server default charset id (0 if not sent)
    pub language: u8,
    pub status_flags: ServerStatusFlags,
}

impl Greeting {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (protocol_version, data) = read_int_1(payload)?;
        if protocol_version == ERR_HEADER {
            return Err(Error::ServerError(ServerError::parse(payload)?));
        }

        let (server_version, data) = read_string_null(data);
        let server_version = String::from_utf8_lossy(server_version).into_owned();
        let version = ServerVersion::parse(&server_version)?;
        let (thread_id, data) = read_int_4(data)?;
        let (seed, mut data) = read_string_null(data);
        let mut seed = seed.to_vec();

        let mut capabilities = CapabilityFlags::empty();
        if data.len() >= 2 {
            let (caps, rest) = read_int_2(data)?;
            capabilities = CapabilityFlags::from_bits_retain(u32::from(caps));
            data = rest;
        }

        let mut language = 0;
        let mut status_flags = ServerStatusFlags::empty();
        if version.is_at_least(4, 1, 1) {
            let (tail, rest) = GreetingTail41::read_from_prefix(data)
                .map_err(|_| Error::protocol("greeting too short"))?;
            language = tail.language;
            status_flags = ServerStatusFlags::from_bits_retain(tail.status_flags.get());
            // newer servers append the auth plugin name after the second seed part
            let (seed_part2, _plugin) = read_string_null(rest);
            seed.extend_from_slice(seed_part2);
        }

        Ok(Self {
            protocol_version,
            server_version,
            version,
            thread_id,
            seed,
            capabilities,
            language,
            status_flags,
        })
    }

    /// Client capabilities requested for this server and descriptor
    pub fn client_flags(&self, opts: &Opts) -> CapabilityFlags {
        let server = self.capabilities;
        let mut flags = CapabilityFlags::CLIENT_FOUND_ROWS;

        if self.version.is_at_least(4, 1, 1) {
            flags |= CapabilityFlags::CLIENT_PROTOCOL_41
                | CapabilityFlags::CLIENT_TRANSACTIONS
                | CapabilityFlags::CLIENT_MULTI_RESULTS;
            if opts.allow_batch {
                flags |= CapabilityFlags::CLIENT_MULTI_STATEMENTS;
            }
        } else if self.version.is_at_least(4, 1, 0) {
            flags |= CapabilityFlags::CLIENT_RESERVED;
        }

        if server.contains(CapabilityFlags::CLIENT_LONG_FLAG) {
            flags |= CapabilityFlags::CLIENT_LONG_FLAG;
        }
        if server.contains(CapabilityFlags::CLIENT_COMPRESS) && opts.compress {
            flags |= CapabilityFlags::CLIENT_COMPRESS;
        }
        if self.protocol_version > 9 {
            flags |= CapabilityFlags::CLIENT_LONG_PASSWORD;
        }
        if opts.local_infile {
            flags |= CapabilityFlags::CLIENT_LOCAL_FILES;
        }
        if server.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB)
            && opts.db.as_deref().is_some_and(|db| !db.is_empty())
        {
            flags |= CapabilityFlags::CLIENT_CONNECT_WITH_DB;
        }
        if server.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) && !opts.old_auth {
            flags |= CapabilityFlags::CLIENT_SECURE_CONNECTION;
        }
        flags
    }

    /// Whether authentication uses the 4.1 SHA1 scramble
    pub fn uses_secure_auth(&self, flags: CapabilityFlags) -> bool {
        self.version.is_at_least(4, 1, 1) && flags.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION)
    }
}

// ============================================================================
// Scrambles
// ============================================================================

/// Legacy password hash: two 31-bit words
fn hash_323(data: &[u8]) -> [u32; 2] {
    let mut nr: u32 = 1345345333;
    let mut add: u32 = 7;
    let mut nr2: u32 = 0x12345671;

    for &c in data.iter().filter(|&&c| c != b' ' && c != b'\t') {
        let c = u32::from(c);
        nr ^= ((nr & 63).wrapping_add(add))
            .wrapping_mul(c)
            .wrapping_add(nr << 8);
        nr2 = nr2.wrapping_add((nr2 << 8) ^ nr);
        add = add.wrapping_add(c);
    }

    [nr & 0x7FFF_FFFF, nr2 & 0x7FFF_FFFF]
}

struct Rand323 {
    seed1: u64,
    seed2: u64,
    max: u64,
}

impl Rand323 {
    fn next(&mut self) -> f64 {
        self.seed1 = (self.seed1 * 3 + self.seed2) % self.max;
        self.seed2 = (self.seed1 + self.seed2 + 33) % self.max;
        self.seed1 as f64 / self.max as f64
    }

    fn next_char_offset(&mut self) -> u8 {
        (self.next() * 31.0).floor() as u8
    }
}

/// Pre-4.1 password scramble, one output char per seed byte.
///
/// `new_ver` selects the protocol 10 variant (larger modulus plus a final XOR byte).
/// An empty password scrambles to nothing.
pub fn scramble_323(password: &str, seed: &[u8], new_ver: bool) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let hp = hash_323(password.as_bytes());
    let hs = hash_323(seed);
    let max: u64 = if new_ver { 0x3FFF_FFFF } else { 0x01FF_FFFF };

    let seed1 = u64::from(hs[0] ^ hp[0]) % max;
    let seed2 = if new_ver {
        u64::from(hs[1] ^ hp[1]) % max
    } else {
        seed1 / 2
    };
    let mut rand = Rand323 { seed1, seed2, max };

    let mut out: Vec<u8> = seed.iter().map(|_| rand.next_char_offset() + 64).collect();
    if new_ver {
        let extra = rand.next_char_offset();
        for c in &mut out {
            *c ^= extra;
        }
    }
    out
}

/// 4.1 scramble: `0x14` followed by `SHA1(pw) XOR SHA1(seed + SHA1(SHA1(pw)))`.
///
/// An empty password is sent as a single zero byte.
pub fn scramble_411(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![0];
    }

    let stage1 = Sha1::digest(password.as_bytes());
    let stage2 = Sha1::digest(stage1);

    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let token = hasher.finalize();

    let mut out = Vec::with_capacity(21);
    out.push(20);
    out.extend(stage1.iter().zip(token.iter()).map(|(a, b)| a ^ b));
    out
}

// ============================================================================
// Client packets
// ============================================================================

/// Credentials written by the handshake response and by CHANGE_USER
#[derive(Debug, Clone, Copy)]
pub struct Credentials<'a> {
    pub user: &'a str,
    pub password: &'a str,
    pub db: Option<&'a str>,
}

impl<'a> Credentials<'a> {
    pub fn from_opts(opts: &'a Opts) -> Self {
        Self {
            user: &opts.user,
            password: &opts.password,
            db: opts.db.as_deref().filter(|db| !db.is_empty()),
        }
    }
}

/// Write user, scrambled password and database
pub fn write_auth(out: &mut Vec<u8>, greeting: &Greeting, flags: CapabilityFlags, creds: &Credentials<'_>) {
    write_bytes_null(out, creds.user.as_bytes());

    if greeting.uses_secure_auth(flags) {
        out.extend_from_slice(&scramble_411(creds.password, &greeting.seed));
    } else {
        let seed = greeting.seed.get(..8).unwrap_or(&greeting.seed);
        let scrambled = scramble_323(creds.password, seed, greeting.protocol_version > 9);
        write_bytes_null(out, &scrambled);
    }

    if flags.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB)
        && let Some(db) = creds.db
    {
        write_bytes_null(out, db.as_bytes());
    }
}

/// Write the client handshake response
pub fn write_handshake_response(
    out: &mut Vec<u8>,
    greeting: &Greeting,
    flags: CapabilityFlags,
    max_packet: usize,
    creds: &Credentials<'_>,
) {
    if greeting.version.is_at_least(4, 1, 0) {
        write_int_4(out, flags.bits());
        write_int_4(out, max_packet as u32);
    } else {
        write_int_2(out, flags.bits() as u16);
        write_int_3(out, max_packet as u32);
    }

    if greeting.version.is_at_least(4, 1, 1) {
        write_int_1(out, HANDSHAKE_CHARSET);
        out.extend_from_slice(&[0u8; 23]);
    }

    write_auth(out, greeting, flags, creds);
}

/// Reply to a server that asked for the legacy scramble after a 4.1 attempt
pub fn write_old_password(out: &mut Vec<u8>, greeting: &Greeting, password: &str) {
    let seed = greeting.seed.get(..8).unwrap_or(&greeting.seed);
    write_bytes_null(out, &scramble_323(password, seed, true));
}
