use std::io::Read;
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::time::Duration;

use log::debug;
use ssh2::Session;

use crate::connector::CollectionCause;
use crate::types::Credentials;

const READ_CHUNK: usize = 4096;

/// Open an authenticated SSH session. `timeout` bounds the TCP connect and
/// every blocking call on the session afterwards.
pub(crate) fn open_session(
    host: IpAddr,
    port: u16,
    timeout: Duration,
    credentials: &Credentials,
) -> Result<Session, CollectionCause> {
    let address = SocketAddr::new(host, port);
    debug!("Opening TCP connection to {address}");
    let tcp = TcpStream::connect_timeout(&address, timeout)?;

    let mut session = Session::new()?;
    session.set_tcp_stream(tcp);
    session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
    session.handshake()?;

    session
        .userauth_password(&credentials.username, &credentials.password)
        .map_err(|_| CollectionCause::Auth(credentials.username.clone()))?;
    if !session.authenticated() {
        return Err(CollectionCause::Auth(credentials.username.clone()));
    }

    Ok(session)
}

/// Read from `reader` until `done` accepts everything received so far.
pub(crate) fn read_until<R, F>(reader: &mut R, done: F) -> Result<Vec<u8>, CollectionCause>
where
    R: Read,
    F: Fn(&[u8]) -> bool,
{
    let mut received = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let read = reader.read(&mut chunk)?;
        if read == 0 {
            return Err(CollectionCause::Protocol(
                "connection closed before the expected output arrived".to_string(),
            ));
        }
        received.extend_from_slice(&chunk[..read]);

        if done(&received) {
            return Ok(received);
        }
    }
}
