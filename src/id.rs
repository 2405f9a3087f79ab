use rand::seq::SliceRandom;
use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Prefix carried by every generated session id.
pub const SESSION_ID_PREFIX: &str = "PL";

/// Length of the random body between the prefix and the timestamp suffix.
pub const SESSION_ID_BODY_LEN: usize = 12;

const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const DIGITS: &[u8] = b"0123456789";
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generate an opaque session id of the form `PL_<body>_<ts>`.
///
/// The body always mixes at least two uppercase letters, two lowercase
/// letters and two digits, shuffled. The suffix is the last four base36
/// digits of the current unix time in milliseconds. Uniqueness is not
/// guaranteed here; the registry retries on collision.
pub fn make_session_id() -> String {
    let mut rng = rand::thread_rng();
    let all: Vec<u8> = [UPPER, LOWER, DIGITS].concat();

    let mut body: Vec<u8> = Vec::with_capacity(SESSION_ID_BODY_LEN);
    for set in [UPPER, LOWER, DIGITS] {
        for _ in 0..2 {
            body.push(set[rng.gen_range(0..set.len())]);
        }
    }
    while body.len() < SESSION_ID_BODY_LEN {
        body.push(all[rng.gen_range(0..all.len())]);
    }
    body.shuffle(&mut rng);

    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();
    let stamp = to_base36(millis);
    let suffix = &stamp[stamp.len().saturating_sub(4)..];

    format!(
        "{}_{}_{:0>4}",
        SESSION_ID_PREFIX,
        String::from_utf8_lossy(&body),
        suffix
    )
}

/// Check that `id` has the shape produced by [`make_session_id`].
pub fn is_valid_session_id(id: &str) -> bool {
    let mut parts = id.split('_');
    let (Some(prefix), Some(body), Some(stamp), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    prefix == SESSION_ID_PREFIX
        && body.len() == SESSION_ID_BODY_LEN
        && body.bytes().all(|b| b.is_ascii_alphanumeric())
        && stamp.len() == 4
        && stamp.bytes().all(|b| BASE36.contains(&b))
}

fn to_base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(BASE36[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}
