//! Room State Management

use std::collections::HashMap;
use std::time::Instant;

use crate::api::{MemberResponse, Role, Video};

/// Playback phase of a room
#[derive(Debug, Clone, Default, PartialEq)]
pub enum PlaybackState {
    #[default]
    NoVideo,
    Paused {
        video: Video,
        position: f64,
    },
    /// `position` is the playhead at `started_at`
    Playing {
        video: Video,
        position: f64,
        started_at: Instant,
    },
}

/// The room's view of playback, as last set by the host
#[derive(Debug, Clone, Default)]
pub struct RoomPlayback {
    state: PlaybackState,
    last_update: Option<Instant>,
}

impl RoomPlayback {
    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn last_update(&self) -> Option<Instant> {
        self.last_update
    }

    pub fn video(&self) -> Option<&Video> {
        match &self.state {
            PlaybackState::NoVideo => None,
            PlaybackState::Paused { video, .. } | PlaybackState::Playing { video, .. } => Some(video),
        }
    }

    pub fn video_id(&self) -> Option<i64> {
        self.video().map(|v| v.id)
    }

    pub fn is_playing(&self) -> bool {
        matches!(self.state, PlaybackState::Playing { .. })
    }

    /// Extrapolated playhead
    pub fn position_at(&self, now: Instant) -> f64 {
        match &self.state {
            PlaybackState::NoVideo => 0.0,
            PlaybackState::Paused { position, .. } => *position,
            PlaybackState::Playing {
                position, started_at, ..
            } => position + now.saturating_duration_since(*started_at).as_secs_f64(),
        }
    }

    /// Any state -> Paused(video, 0)
    pub fn load(&mut self, video: Video, now: Instant) {
        self.state = PlaybackState::Paused { video, position: 0.0 };
        self.last_update = Some(now);
    }

    /// NoVideo/Paused -> Playing. Returns false without a video.
    pub fn play(&mut self, position: f64, now: Instant) -> bool {
        let Some(video) = self.video().cloned() else {
            return false;
        };
        self.state = PlaybackState::Playing {
            video,
            position,
            started_at: now,
        };
        self.last_update = Some(now);
        true
    }

    /// Playing -> Paused. A paused room just moves its playhead.
    pub fn pause(&mut self, position: f64, now: Instant) -> bool {
        let Some(video) = self.video().cloned() else {
            return false;
        };
        self.state = PlaybackState::Paused { video, position };
        self.last_update = Some(now);
        true
    }

    /// Move the playhead, keeping play/pause mode
    pub fn seek(&mut self, position: f64, now: Instant) -> bool {
        match &mut self.state {
            PlaybackState::NoVideo => return false,
            PlaybackState::Paused { position: p, .. } => *p = position,
            PlaybackState::Playing {
                position: p, started_at, ..
            } => {
                *p = position;
                *started_at = now;
            }
        }
        self.last_update = Some(now);
        true
    }

    pub fn clear(&mut self, now: Instant) {
        self.state = PlaybackState::NoVideo;
        self.last_update = Some(now);
    }
}

/// A room member and their presence
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub user_id: i64,
    pub username: String,
    pub role: Role,
    pub online: bool,
}

/// Room roster. Roles come from the backend, presence from broadcasts.
#[derive(Debug, Clone, Default)]
pub struct Membership {
    members: HashMap<i64, Member>,
}

impl Membership {
    /// Apply a roster fetch, keeping presence for known members
    pub fn apply_roster(&mut self, roster: Vec<MemberResponse>) {
        let mut next = HashMap::with_capacity(roster.len());
        for row in roster {
            let online = self.members.get(&row.user.id).is_some_and(|m| m.online);
            next.insert(
                row.user.id,
                Member {
                    user_id: row.user.id,
                    username: row.user.username,
                    role: row.role,
                    online,
                },
            );
        }
        // Members seen only through presence stay until the next roster says otherwise
        for (id, member) in self.members.drain() {
            if member.online {
                next.entry(id).or_insert(member);
            }
        }
        self.members = next;
    }

    /// Presence: someone joined
    pub fn joined(&mut self, user_id: i64, username: Option<&str>) {
        let member = self.members.entry(user_id).or_insert_with(|| Member {
            user_id,
            username: String::new(),
            role: Role::Member,
            online: false,
        });
        member.online = true;
        if let Some(name) = username {
            member.username = name.to_string();
        }
    }

    /// Presence: someone left. Returns the departed member.
    pub fn left(&mut self, user_id: i64) -> Option<&Member> {
        let member = self.members.get_mut(&user_id)?;
        member.online = false;
        Some(member)
    }

    pub fn get(&self, user_id: i64) -> Option<&Member> {
        self.members.get(&user_id)
    }

    pub fn role_of(&self, user_id: i64) -> Option<Role> {
        self.members.get(&user_id).map(|m| m.role)
    }

    /// Any online host or admin
    pub fn has_online_host(&self) -> bool {
        self.members
            .values()
            .any(|m| m.online && m.role.controls_playback())
    }

    /// Hosts first, then admins, then everyone else by lowercase name
    pub fn list(&self) -> Vec<&Member> {
        let mut list: Vec<&Member> = self.members.values().collect();
        list.sort_by(|a, b| {
            rank(a.role)
                .cmp(&rank(b.role))
                .then_with(|| a.username.to_lowercase().cmp(&b.username.to_lowercase()))
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        list
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

fn rank(role: Role) -> u8 {
    match role {
        Role::Host => 0,
        Role::Admin => 1,
        Role::Member => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::UserRef;
    use std::time::Duration;

    fn video(id: i64) -> Video {
        Video {
            id,
            title: format!("v{}", id),
            media_url: Some(format!("https://cdn/{}.mp4", id)),
            thumbnail_url: None,
        }
    }

    fn member(id: i64, name: &str, role: Role) -> MemberResponse {
        MemberResponse {
            user: UserRef {
                id,
                username: name.to_string(),
            },
            role,
        }
    }

    #[test]
    fn test_transitions() {
        let now = Instant::now();
        let mut playback = RoomPlayback::default();

        assert!(!playback.play(1.0, now));
        assert_eq!(playback.state(), &PlaybackState::NoVideo);

        playback.load(video(7), now);
        assert_eq!(playback.video_id(), Some(7));
        assert!(!playback.is_playing());
        assert_eq!(playback.position_at(now), 0.0);

        assert!(playback.play(42.0, now));
        assert!(playback.is_playing());
        assert_eq!(playback.position_at(now + Duration::from_secs(3)), 45.0);

        let later = now + Duration::from_secs(5);
        assert!(playback.seek(10.0, later));
        assert!(playback.is_playing());
        assert_eq!(playback.position_at(later + Duration::from_secs(1)), 11.0);

        assert!(playback.pause(12.0, later));
        assert_eq!(playback.position_at(later + Duration::from_secs(60)), 12.0);
        assert_eq!(playback.last_update(), Some(later));
    }

    #[test]
    fn test_member_list_order() {
        let mut members = Membership::default();
        members.apply_roster(vec![
            member(3, "zed", Role::Member),
            member(1, "Host", Role::Host),
            member(2, "amy", Role::Member),
            member(4, "Bob", Role::Admin),
        ]);

        let names: Vec<&str> = members.list().iter().map(|m| m.username.as_str()).collect();
        assert_eq!(names, vec!["Host", "Bob", "amy", "zed"]);
    }

    #[test]
    fn test_presence_survives_roster_refresh() {
        let mut members = Membership::default();
        members.apply_roster(vec![member(1, "host", Role::Host)]);
        members.joined(1, Some("host"));
        members.joined(9, Some("guest"));

        members.apply_roster(vec![member(1, "host", Role::Host)]);
        assert!(members.get(1).unwrap().online);
        assert!(members.get(9).is_some());
        assert!(members.has_online_host());

        let left = members.left(1).unwrap();
        assert!(!left.online);
        assert!(!members.has_online_host());
    }
}
