//! Consistent-hashing ring of registered participants, used by the
//! coordinator to place each key on a primary and a secondary replica.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use tokio::sync::watch;

use crate::utils::{hash64, TandemError};

/// One registered participant server. Identity is `id`; host and port may
/// be replaced by a re-registration without moving the ring position.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ParticipantInfo {
    pub id: u64,
    pub host: String,
    pub port: u16,
}

impl ParticipantInfo {
    /// `"host:port"` address form accepted by connect calls.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for ParticipantInfo {
    type Err = TandemError;

    /// Parses the wire form `"<64-bit id>@<hostname>:<port>"`. The id may be
    /// written signed or unsigned; a signed value is reinterpreted as its
    /// two's-complement `u64`, which is the ordering the ring uses. Hostname
    /// is restricted to letters, digits, and hyphens.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (id_str, addr_str) =
            s.split_once('@').ok_or(TandemError::InvalidFormat)?;
        let (host, port_str) =
            addr_str.rsplit_once(':').ok_or(TandemError::InvalidFormat)?;

        let id = match id_str.parse::<u64>() {
            Ok(id) => id,
            Err(_) => id_str
                .parse::<i64>()
                .map_err(|_| TandemError::InvalidFormat)?
                as u64,
        };

        if host.is_empty()
            || !host.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(TandemError::InvalidFormat);
        }

        let port =
            port_str.parse::<u16>().map_err(|_| TandemError::InvalidFormat)?;

        Ok(ParticipantInfo {
            id,
            host: host.into(),
            port,
        })
    }
}

impl fmt::Display for ParticipantInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.host, self.port)
    }
}

/// Shared ring state: the sorted membership list plus the "fully formed"
/// barrier. All mutation happens under the one inner lock; waiters block on
/// a watch channel that carries the registration count.
pub struct ReplicaRing {
    /// Configured participant count; writes wait until membership reaches
    /// this before any transaction runs.
    slots: usize,

    /// Members sorted ascending by unsigned id, at most one entry per id.
    members: Mutex<Vec<ParticipantInfo>>,

    /// Registration count channel for the membership barrier.
    tx_count: watch::Sender<usize>,
}

impl ReplicaRing {
    /// Creates an empty ring expecting `slots` participants.
    pub fn new(slots: usize) -> Self {
        assert!(slots > 0, "ring must expect at least one participant");
        let (tx_count, _) = watch::channel(0);
        ReplicaRing {
            slots,
            members: Mutex::new(Vec::new()),
            tx_count,
        }
    }

    /// Registers a participant. A known id has its host/port replaced in
    /// place (a crashed participant coming back online); an unknown id is
    /// inserted in sorted position unless the ring is already full, in which
    /// case the registration is dropped.
    pub fn register(&self, info: ParticipantInfo) {
        let mut members = self.lock_members();

        if let Some(member) =
            members.iter_mut().find(|m| m.id == info.id)
        {
            pf_info!("m"; "participant {} re-registered", info);
            *member = info;
            return;
        }

        if members.len() >= self.slots {
            pf_warn!("m"; "ring full, dropping registration of {}", info);
            return;
        }

        let pos = members.partition_point(|m| m.id < info.id);
        pf_info!("m"; "participant {} registered", info);
        members.insert(pos, info);
        self.tx_count.send_replace(members.len());
    }

    /// Number of participants currently registered (non-blocking).
    pub fn registered(&self) -> usize {
        self.lock_members().len()
    }

    /// Configured participant count.
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Blocks until the ring has reached its configured participant count.
    pub async fn wait_full(&self) {
        let mut rx_count = self.tx_count.subscribe();
        while *rx_count.borrow_and_update() < self.slots {
            if rx_count.changed().await.is_err() {
                return; // ring dropped; nothing left to wait for
            }
        }
    }

    /// The first replica for `key`: the first member (by unsigned id order)
    /// whose id is at or past the key's hash, wrapping to the smallest.
    pub fn find_primary(&self, key: &str) -> Option<ParticipantInfo> {
        let members = self.lock_members();
        match members.len() {
            0 => None,
            1 => Some(members[0].clone()),
            _ => {
                let pos = hash64(key);
                Some(
                    members
                        .iter()
                        .find(|m| pos <= m.id)
                        .unwrap_or(&members[0])
                        .clone(),
                )
            }
        }
    }

    /// The successor of `primary`: the next member strictly past it in id
    /// order, wrapping to the smallest. With a single member the ring
    /// degenerates to self-replication.
    pub fn find_secondary(
        &self,
        primary: &ParticipantInfo,
    ) -> Option<ParticipantInfo> {
        let members = self.lock_members();
        match members.len() {
            0 => None,
            1 => Some(members[0].clone()),
            _ => Some(
                members
                    .iter()
                    .find(|m| primary.id < m.id)
                    .unwrap_or(&members[0])
                    .clone(),
            ),
        }
    }

    fn lock_members(
        &self,
    ) -> std::sync::MutexGuard<'_, Vec<ParticipantInfo>> {
        self.members
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod ring_tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::{self, Duration};

    fn info(id: u64, port: u16) -> ParticipantInfo {
        ParticipantInfo {
            id,
            host: "localhost".into(),
            port,
        }
    }

    #[test]
    fn parse_valid_infos() -> Result<(), TandemError> {
        let info: ParticipantInfo = "7@localhost:5000".parse()?;
        assert_eq!(
            info,
            ParticipantInfo {
                id: 7,
                host: "localhost".into(),
                port: 5000,
            }
        );
        let info: ParticipantInfo = "-1@node-3:9090".parse()?;
        assert_eq!(info.id, u64::MAX); // signed input, unsigned identity
        assert_eq!(info.host, "node-3");
        assert_eq!(format!("{}", info), format!("{}@node-3:9090", u64::MAX));
        Ok(())
    }

    #[test]
    fn parse_invalid_infos() {
        for s in [
            "",
            "localhost:5000",          // no id
            "7@localhost",             // no port
            "7@:5000",                 // empty host
            "x7@localhost:5000",       // non-numeric id
            "7@local host:5000",       // bad host char
            "7@local_host:5000",       // bad host char
            "7@localhost:99999",       // port out of range
            "7@localhost:-1",          // negative port
        ] {
            assert_eq!(
                s.parse::<ParticipantInfo>(),
                Err(TandemError::InvalidFormat),
                "'{}' should be rejected",
                s
            );
        }
    }

    #[test]
    fn members_kept_sorted_unsigned() {
        let ring = ReplicaRing::new(3);
        // i64-signed comparison would order u64::MAX first; unsigned
        // ordering must put it last
        ring.register(info(u64::MAX, 1));
        ring.register(info(5, 2));
        ring.register(info(1000, 3));
        assert_eq!(ring.registered(), 3);

        let succ = ring.find_secondary(&info(5, 0)).unwrap();
        assert_eq!(succ.id, 1000);
        let succ = ring.find_secondary(&info(1000, 0)).unwrap();
        assert_eq!(succ.id, u64::MAX);
        let succ = ring.find_secondary(&info(u64::MAX, 0)).unwrap();
        assert_eq!(succ.id, 5); // wraparound
    }

    #[test]
    fn reregistration_updates_in_place() {
        let ring = ReplicaRing::new(2);
        ring.register(info(1, 5001));
        ring.register(info(2, 5002));
        ring.register(ParticipantInfo {
            id: 1,
            host: "node-9".into(),
            port: 6001,
        });
        assert_eq!(ring.registered(), 2);
        let primary = ring.find_secondary(&info(2, 0)).unwrap();
        assert_eq!(primary.id, 1);
        assert_eq!(primary.host, "node-9");
        assert_eq!(primary.port, 6001);
    }

    #[test]
    fn full_ring_drops_new_ids() {
        let ring = ReplicaRing::new(2);
        ring.register(info(1, 1));
        ring.register(info(2, 2));
        ring.register(info(3, 3));
        assert_eq!(ring.registered(), 2);
        assert_eq!(ring.find_secondary(&info(2, 0)).map(|m| m.id), Some(1));
    }

    #[test]
    fn empty_and_single_member_lookups() {
        let ring = ReplicaRing::new(2);
        assert_eq!(ring.find_primary("a"), None);
        assert_eq!(ring.find_secondary(&info(1, 0)), None);

        ring.register(info(42, 1));
        // single member serves as both replicas
        assert_eq!(ring.find_primary("a").map(|m| m.id), Some(42));
        let primary = ring.find_primary("a").unwrap();
        assert_eq!(ring.find_secondary(&primary).map(|m| m.id), Some(42));
    }

    #[test]
    fn lookups_deterministic_and_cover_members() {
        let ring = ReplicaRing::new(3);
        ring.register(info(100, 1));
        ring.register(info(u64::MAX / 2, 2));
        ring.register(info(u64::MAX - 100, 3));

        for key in ["a", "b", "the-key", "another", "x1", "x2", "x3"] {
            let primary = ring.find_primary(key).unwrap();
            let secondary = ring.find_secondary(&primary).unwrap();
            // repeated lookups agree
            assert_eq!(ring.find_primary(key), Some(primary.clone()));
            assert_eq!(
                ring.find_secondary(&primary),
                Some(secondary.clone())
            );
            // both land on registered members, and on distinct ones
            for replica in [&primary, &secondary] {
                assert!(
                    [100, u64::MAX / 2, u64::MAX - 100].contains(&replica.id)
                );
            }
            assert_ne!(primary.id, secondary.id);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wait_full_barrier() {
        let ring = Arc::new(ReplicaRing::new(2));
        let ring_reg = ring.clone();
        tokio::spawn(async move {
            time::sleep(Duration::from_millis(20)).await;
            ring_reg.register(info(1, 1));
            time::sleep(Duration::from_millis(20)).await;
            ring_reg.register(info(2, 2));
        });
        ring.wait_full().await;
        assert_eq!(ring.registered(), 2);
        // an already-full ring does not block
        ring.wait_full().await;
    }
}
