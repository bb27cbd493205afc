use crate::constant::{CapabilityFlags, CommandByte};
use crate::protocol::connection::{Credentials, Greeting, write_auth};
use crate::protocol::primitive::*;

/// Write COM_QUIT command
pub fn write_quit(out: &mut Vec<u8>) {
    write_int_1(out, CommandByte::Quit as u8);
}

/// Write COM_PING command
pub fn write_ping(out: &mut Vec<u8>) {
    write_int_1(out, CommandByte::Ping as u8);
}

/// Write COM_INIT_DB command
pub fn write_init_db(out: &mut Vec<u8>, database: &[u8]) {
    write_int_1(out, CommandByte::InitDb as u8);
    out.extend_from_slice(database);
}

/// Write COM_CHANGE_USER: the command byte followed by a fresh authentication block
pub fn write_change_user(out: &mut Vec<u8>, greeting: &Greeting, flags: CapabilityFlags, creds: &Credentials<'_>) {
    write_int_1(out, CommandByte::ChangeUser as u8);
    write_auth(out, greeting, flags, creds);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_commands() {
        let mut out = Vec::new();
        write_quit(&mut out);
        write_ping(&mut out);
        write_init_db(&mut out, b"game");
        assert_eq!(out, b"\x01\x0e\x02game");
    }

    #[test]
    fn change_user_legacy_server() {
        let mut greeting = vec![10];
        write_bytes_null(&mut greeting, b"4.0.20");
        write_int_4(&mut greeting, 1);
        write_bytes_null(&mut greeting, b"abcdefgh");
        write_int_2(&mut greeting, CapabilityFlags::CLIENT_CONNECT_WITH_DB.bits() as u16);
        let greeting = Greeting::parse(&greeting).unwrap();

        let flags = CapabilityFlags::CLIENT_CONNECT_WITH_DB | CapabilityFlags::CLIENT_LONG_PASSWORD;
        let creds = Credentials {
            user: "u",
            password: "password",
            db: Some("game"),
        };
        let mut out = Vec::new();
        write_change_user(&mut out, &greeting, flags, &creds);
        assert_eq!(out, b"\x11u\0L^]ZDSEU\0game\0");
    }
}
