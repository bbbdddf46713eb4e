//! Liveness probes.

use tracing::{debug, trace, warn};

use crate::protocol::heartbeat_ack;
use crate::shutdown::ShutdownSignal;
use crate::socket::{LaneEndpoint, Received};

/// Answers every probe with the same pre-encoded acknowledgement. The probe
/// body is read and ignored.
pub fn run_heartbeat(endpoint: LaneEndpoint, shutdown: ShutdownSignal) {
    debug!("heartbeat lane started");
    let ack = heartbeat_ack();

    while !shutdown.is_triggered() {
        let client = match endpoint.recv() {
            Received::Request(client, probe) => {
                trace!(%client, probe = %hex::encode(&probe), "heartbeat probe");
                client
            }
            Received::Malformed => continue,
            Received::Closed => break,
        };

        if let Err(err) = endpoint.reply.send(client, ack.clone()) {
            warn!(%client, error = %err, "failed to send heartbeat ack");
        }
    }

    debug!("heartbeat lane stopped");
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::frame::addressed;
    use crate::identity::ClientId;
    use crate::socket::lane_pair;

    #[test]
    fn acks_regardless_of_payload() {
        let (mut socket, endpoint) = lane_pair("heartbeat");
        let inbound = socket.inbound.clone();
        let lane = thread::spawn(move || run_heartbeat(endpoint, ShutdownSignal::new()));

        let client = ClientId::new([0, 0, 0, 0, 3]);
        inbound
            .send(vec![Bytes::from_static(b"bad"), Bytes::new()])
            .expect("lane alive");
        for probe in [&b""[..], b"\x02\x07", b"garbage that is not a header"] {
            inbound
                .send(addressed(client, Bytes::copy_from_slice(probe)))
                .expect("lane alive");
        }

        let mut acks = Vec::new();
        for _ in 0..200 {
            while let Ok(message) = socket.outbound.try_recv() {
                acks.push(message);
            }
            if acks.len() == 3 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(acks.len(), 3);
        for ack in acks {
            assert_eq!(ack[0].as_ref(), client.as_bytes());
            assert_eq!(ack[1], heartbeat_ack());
        }

        drop(inbound);
        drop(socket);
        lane.join().expect("heartbeat lane exits");
    }
}
