use std::fmt;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Last minted (millis, counter) pair. The counter disambiguates ids minted
/// within the same millisecond so lexicographic order always equals mint order
/// in one process.
static MINT: Mutex<(u64, u32)> = Mutex::new((0, 0));

/// Mint a sortable identifier: `<prefix>_<12-hex millis><4-hex seq><8-hex random>`.
pub fn generate(prefix: &str) -> String {
    let (millis, seq) = {
        let mut mint = MINT.lock();
        let now = now_millis();
        if now > mint.0 {
            *mint = (now, 0);
        } else {
            // Clock stalled or went backwards: stay on the last tick and bump.
            // The counter field is 4 hex digits wide; borrow into the tick on
            // saturation so the format stays fixed-width and ordered.
            mint.1 += 1;
            if mint.1 > 0xFFFF {
                mint.0 += 1;
                mint.1 = 0;
            }
        }
        *mint
    };
    format!("{prefix}_{millis:012x}{seq:04x}{:08x}", random_u32())
}

/// Recover the embedded mint timestamp from an id, in epoch milliseconds.
/// Returns `None` for ids not produced by [`generate`].
pub fn created_ms(id: &str) -> Option<u64> {
    let body = id.split_once('_')?.1;
    if body.len() < 12 {
        return None;
    }
    u64::from_str_radix(&body[..12], 16).ok()
}

/// Non-cryptographic xorshift random, seeded from the clock per thread.
fn random_u32() -> u32 {
    use std::cell::Cell;
    use std::time::SystemTime;

    thread_local! {
        static STATE: Cell<u64> = Cell::new(
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64
                | 1,
        );
    }

    STATE.with(|s| {
        let mut x = s.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        s.set(x);
        x as u32
    })
}

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(generate($prefix))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Epoch milliseconds embedded at mint time, if any.
            pub fn created_ms(&self) -> Option<u64> {
                created_ms(&self.0)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(SessionId, "ses");
branded_id!(MessageId, "msg");
branded_id!(PartId, "prt");
branded_id!(PermissionId, "perm");
branded_id!(ToolOutputId, "out");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_their_prefix() {
        assert!(SessionId::new().as_str().starts_with("ses_"));
        assert!(MessageId::new().as_str().starts_with("msg_"));
        assert!(PartId::new().as_str().starts_with("prt_"));
        assert!(PermissionId::new().as_str().starts_with("perm_"));
        assert!(ToolOutputId::new().as_str().starts_with("out_"));
    }

    #[test]
    fn ids_are_strictly_ascending() {
        let mut prev = generate("ses");
        for _ in 0..10_000 {
            let next = generate("ses");
            assert!(next > prev, "{next} !> {prev}");
            prev = next;
        }
    }

    #[test]
    fn ascending_across_threads_within_each_thread() {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(|| {
                    let mut prev = generate("msg");
                    for _ in 0..1000 {
                        let next = generate("msg");
                        assert!(next > prev);
                        prev = next;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn embedded_timestamp_recoverable() {
        let before = now_millis();
        let id = ToolOutputId::new();
        let after = now_millis();

        let ts = id.created_ms().unwrap();
        // The mint clock never goes backwards, so the embedded tick can run
        // ahead of wall time but never behind the pre-mint reading.
        assert!(ts >= before);
        assert!(ts <= after + 1000);
    }

    #[test]
    fn created_ms_rejects_foreign_ids() {
        assert_eq!(created_ms("no-separator"), None);
        assert_eq!(created_ms("ses_short"), None);
        assert_eq!(created_ms("ses_zzzzzzzzzzzz00000000"), None);
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        let id = SessionId::new();
        let parsed: SessionId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn serde_is_transparent() {
        let id = MessageId::from_raw("msg_abc");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#""msg_abc""#);
        let parsed: MessageId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }
}
