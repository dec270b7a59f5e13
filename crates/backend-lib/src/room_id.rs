// ============================
// crates/backend-lib/src/room_id.rs
// ============================
//! Room identifiers: `room_<unix-millis>_<9 lowercase alphanumerics>`.
use chrono::Utc;
use rand::{distr::Alphanumeric, Rng};

const SUFFIX_LEN: usize = 9;

/// Mint a fresh room identifier
pub fn generate() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();

    format!("room_{}_{}", Utc::now().timestamp_millis(), suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::validate_room_id;
    use std::collections::HashSet;

    #[test]
    fn test_generated_ids_are_well_formed() {
        let id = generate();
        assert!(validate_room_id(&id).is_ok(), "bad room id {id}");

        let suffix = id.rsplit('_').next().unwrap();
        assert_eq!(suffix.len(), SUFFIX_LEN);
        assert!(suffix.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_generated_ids_do_not_repeat() {
        let ids: HashSet<String> = (0..1000).map(|_| generate()).collect();
        assert_eq!(ids.len(), 1000);
    }
}
