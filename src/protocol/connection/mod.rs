mod handshake;

pub use handshake::{
    Credentials, Greeting, ServerVersion, scramble_323, scramble_411, write_auth, write_handshake_response,
    write_old_password,
};
