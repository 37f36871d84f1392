use std::time::Duration;
use crate::{BLOCK_SIZE, MAX_FRAME_LEN};

#[derive(Debug, Clone)]
pub struct Config {

    // Transfer unit for piece data.
    pub block_size: usize,

    // Largest frame the codec will accept.
    pub max_frame_len: usize,

    // Most requests we will queue from a single peer.
    pub local_reqq: usize,

    // Outstanding-request cap assumed for a peer until its extension
    // handshake advertises one.
    pub default_peer_reqq: usize,

    // Whether we advertise and honour the fast extension.
    pub supports_fast: bool,

    // Whether we advertise the extension protocol.
    pub supports_extended: bool,

    pub disable_pex: bool,

    // Uploads switched off entirely.
    pub no_upload: bool,

    // Metadata may flow but piece data must not.
    pub data_upload_disallowed: bool,

    // How far a peer may run ahead of what it has sent us before we stop
    // serving it.
    pub upload_credit: u64,

    pub keep_alive_interval: Duration,

    pub inbound_timeout: Duration,

    pub pex_interval: Duration,

    // Largest metadata_size we will accept from an extension handshake.
    pub max_metadata_size: usize,

    // Client name sent in our extension handshake.
    pub client_name: String,

    pub listen_port: u16,

}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: BLOCK_SIZE,
            max_frame_len: MAX_FRAME_LEN,
            local_reqq: 250,
            default_peer_reqq: 64,
            supports_fast: true,
            supports_extended: true,
            disable_pex: false,
            no_upload: false,
            data_upload_disallowed: false,
            upload_credit: 100 * 1024,
            keep_alive_interval: Duration::from_secs(120),
            inbound_timeout: Duration::from_secs(180),
            pex_interval: Duration::from_secs(60),
            max_metadata_size: 16 * 1024 * 1024,
            client_name: String::from("peerwire 0.1.0"),
            listen_port: 6881,
        }
    }
}
