use thiserror::Error;

use crate::constants::{ROOM_ID_MAX_LEN, ROOM_ID_MIN_LEN};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomIdError {
    #[error("room id must be {ROOM_ID_MIN_LEN}-{ROOM_ID_MAX_LEN} characters, got {0}")]
    Length(usize),

    #[error("room id contains invalid character {0:?}")]
    InvalidChar(char),
}

/// Check a room id against the accepted shape: 3-64 characters from
/// `[A-Za-z0-9_-]`.
pub fn validate_room_id(id: &str) -> Result<(), RoomIdError> {
    let len = id.chars().count();
    if !(ROOM_ID_MIN_LEN..=ROOM_ID_MAX_LEN).contains(&len) {
        return Err(RoomIdError::Length(len));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '_' && *c != '-')
    {
        return Err(RoomIdError::InvalidChar(bad));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_ids() {
        assert_eq!(validate_room_id("abc"), Ok(()));
        assert_eq!(validate_room_id("Movie-Night_42"), Ok(()));
        assert_eq!(validate_room_id(&"a".repeat(64)), Ok(()));
    }

    #[test]
    fn rejects_bad_lengths() {
        assert_eq!(validate_room_id(""), Err(RoomIdError::Length(0)));
        assert_eq!(validate_room_id("ab"), Err(RoomIdError::Length(2)));
        assert_eq!(
            validate_room_id(&"a".repeat(65)),
            Err(RoomIdError::Length(65))
        );
    }

    #[test]
    fn rejects_bad_characters() {
        assert_eq!(
            validate_room_id("room 1"),
            Err(RoomIdError::InvalidChar(' '))
        );
        assert_eq!(
            validate_room_id("room/1"),
            Err(RoomIdError::InvalidChar('/'))
        );
        assert_eq!(
            validate_room_id("soirée"),
            Err(RoomIdError::InvalidChar('é'))
        );
    }
}
