//! Presence envelopes.

use std::collections::BTreeMap;

use veillee_shared::protocol::{Participant, ServerFrame};

use crate::registry::MemberHandle;

/// Snapshot the current roster into a `presence` envelope. A user with
/// several connections appears once per connection; the legacy `users`
/// name list and the avatar map ride along for older clients.
pub fn envelope<'a>(
    members: impl Iterator<Item = &'a MemberHandle>,
    encryption_required: bool,
) -> ServerFrame {
    let mut participants = Vec::new();
    let mut users = Vec::new();
    let mut avatars = BTreeMap::new();

    for member in members {
        participants.push(Participant {
            id: member.user_id.clone(),
            name: member.name.clone(),
            picture: member.picture.clone(),
        });
        users.push(member.name.clone());
        if let Some(picture) = &member.picture {
            avatars.insert(member.user_id.clone(), picture.clone());
        }
    }

    ServerFrame::Presence {
        participants,
        users,
        avatars,
        encryption_required,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use tokio::sync::mpsc;

    fn handle(name: &str, picture: Option<&str>) -> MemberHandle {
        let (tx, _rx) = mpsc::channel(1);
        MemberHandle::new(
            &Identity {
                user_id: format!("{}-sub", name.to_lowercase()),
                name: name.to_string(),
                picture: picture.map(String::from),
                email: None,
            },
            tx,
        )
    }

    #[test]
    fn roster_carries_participants_users_and_avatars() {
        let members = [
            handle("Alice", Some("https://pic/a.png")),
            handle("Bob", None),
        ];
        let frame = envelope(members.iter(), true);

        let ServerFrame::Presence {
            participants,
            users,
            avatars,
            encryption_required,
        } = frame
        else {
            panic!("not a presence frame");
        };

        assert_eq!(participants.len(), 2);
        assert_eq!(users.len(), 2);
        assert!(users.contains(&"Alice".to_string()));
        assert_eq!(
            avatars.get("alice-sub").map(String::as_str),
            Some("https://pic/a.png")
        );
        assert!(!avatars.contains_key("bob-sub"));
        assert!(encryption_required);
    }

    #[test]
    fn duplicate_connections_of_one_user_are_kept() {
        let members = [handle("Alice", None), handle("Alice", None)];
        let frame = envelope(members.iter(), false);
        let ServerFrame::Presence { participants, .. } = frame else {
            panic!("not a presence frame");
        };
        assert_eq!(participants.len(), 2);
        assert_eq!(participants[0].id, participants[1].id);
    }
}
