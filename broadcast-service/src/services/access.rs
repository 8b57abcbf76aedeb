//! Access resolution for streams and recordings
//!
//! Pure decision functions: entity state plus requester identity in, allow
//! or a closed denial reason out. No I/O and no presentation concerns; the
//! UI layer maps reasons to messaging.

use crate::models::{
    DenialReason, MembershipTier, Recording, RecordingStatus, Requester, Stream,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDecision {
    Allowed,
    Denied(DenialReason),
}

impl AccessDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AccessDecision::Allowed)
    }
}

pub fn can_view_stream(
    stream: &Stream,
    requester: &Requester,
    min_tier: MembershipTier,
) -> AccessDecision {
    // suspension denies regardless of visibility, owner included
    if stream.suspended && !requester.is_admin() {
        return AccessDecision::Denied(DenialReason::Suspended);
    }
    resolve_visibility(
        stream.visibility,
        Some(stream.creator_id),
        requester,
        min_tier,
    )
}

pub fn can_view_recording(
    recording: &Recording,
    requester: &Requester,
    min_tier: MembershipTier,
) -> AccessDecision {
    // deleted or hidden recordings simply do not exist to viewers
    if recording.status == RecordingStatus::Deleted || recording.hidden {
        if !requester.is_admin() {
            return AccessDecision::Denied(DenialReason::NotFound);
        }
    }
    resolve_visibility(recording.visibility, recording.creator_id, requester, min_tier)
}

fn resolve_visibility(
    visibility: crate::models::Visibility,
    owner: Option<uuid::Uuid>,
    requester: &Requester,
    min_tier: MembershipTier,
) -> AccessDecision {
    use crate::models::Visibility;

    let is_owner = match (owner, requester.user_id) {
        (Some(owner), Some(user)) => owner == user,
        _ => false,
    };
    if is_owner || requester.is_admin() {
        return AccessDecision::Allowed;
    }

    match visibility {
        Visibility::Public => AccessDecision::Allowed,
        Visibility::Members => match requester.user_id {
            None => AccessDecision::Denied(DenialReason::NotAuthenticated),
            Some(_) if requester.tier >= min_tier => AccessDecision::Allowed,
            Some(_) => AccessDecision::Denied(DenialReason::InsufficientTier),
        },
        // private content is indistinguishable from absent content
        Visibility::Private => AccessDecision::Denied(DenialReason::NotFound),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContentMode, Role, StreamStatus, Visibility};
    use chrono::Utc;
    use uuid::Uuid;

    fn stream(visibility: Visibility) -> Stream {
        let now = Utc::now();
        Stream {
            id: Uuid::new_v4(),
            creator_id: Uuid::new_v4(),
            provider_stream_id: None,
            credential: "key".to_string(),
            title: "s".to_string(),
            visibility,
            mode: ContentMode::Video,
            status: StreamStatus::Live,
            playback_url: None,
            current_viewers: 0,
            peak_viewers: 0,
            total_unique_viewers: 0,
            suspended: false,
            started_at: None,
            ended_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn recording(visibility: Visibility) -> Recording {
        let now = Utc::now();
        Recording {
            id: Uuid::new_v4(),
            stream_id: None,
            creator_id: Some(Uuid::new_v4()),
            provider_asset_id: None,
            source_session_id: None,
            title: "r".to_string(),
            visibility,
            status: RecordingStatus::Ready,
            playback_url: None,
            duration_seconds: None,
            size_bytes: None,
            resolution: None,
            view_count: 0,
            unique_viewer_count: 0,
            peak_live_viewers: 0,
            failure_reason: None,
            hidden: false,
            ready_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn member(tier: MembershipTier) -> Requester {
        Requester {
            user_id: Some(Uuid::new_v4()),
            tier,
            role: Role::Viewer,
        }
    }

    #[test]
    fn public_stream_is_open_to_anonymous() {
        let decision = can_view_stream(
            &stream(Visibility::Public),
            &Requester::anonymous(),
            MembershipTier::Member,
        );
        assert!(decision.is_allowed());
    }

    #[test]
    fn suspended_stream_denies_even_its_owner() {
        let mut s = stream(Visibility::Public);
        s.suspended = true;
        let owner = Requester {
            user_id: Some(s.creator_id),
            tier: MembershipTier::Premium,
            role: Role::Creator,
        };
        assert_eq!(
            can_view_stream(&s, &owner, MembershipTier::Member),
            AccessDecision::Denied(DenialReason::Suspended)
        );
    }

    #[test]
    fn members_stream_requires_authentication_then_tier() {
        let s = stream(Visibility::Members);

        assert_eq!(
            can_view_stream(&s, &Requester::anonymous(), MembershipTier::Member),
            AccessDecision::Denied(DenialReason::NotAuthenticated)
        );
        assert_eq!(
            can_view_stream(&s, &member(MembershipTier::Free), MembershipTier::Member),
            AccessDecision::Denied(DenialReason::InsufficientTier)
        );
        assert!(can_view_stream(&s, &member(MembershipTier::Member), MembershipTier::Member)
            .is_allowed());
        assert!(can_view_stream(&s, &member(MembershipTier::Premium), MembershipTier::Member)
            .is_allowed());
    }

    #[test]
    fn owner_and_admin_bypass_members_gate() {
        let s = stream(Visibility::Members);
        let owner = Requester {
            user_id: Some(s.creator_id),
            tier: MembershipTier::Free,
            role: Role::Creator,
        };
        assert!(can_view_stream(&s, &owner, MembershipTier::Member).is_allowed());

        let admin = Requester {
            user_id: Some(Uuid::new_v4()),
            tier: MembershipTier::Free,
            role: Role::Admin,
        };
        assert!(can_view_stream(&s, &admin, MembershipTier::Member).is_allowed());
    }

    #[test]
    fn private_stream_conceals_itself_from_non_owners() {
        let s = stream(Visibility::Private);
        assert_eq!(
            can_view_stream(&s, &member(MembershipTier::Premium), MembershipTier::Member),
            AccessDecision::Denied(DenialReason::NotFound)
        );
    }

    #[test]
    fn deleted_or_hidden_recording_is_not_found() {
        let mut r = recording(Visibility::Public);
        r.status = RecordingStatus::Deleted;
        assert_eq!(
            can_view_recording(&r, &member(MembershipTier::Premium), MembershipTier::Member),
            AccessDecision::Denied(DenialReason::NotFound)
        );

        let mut r = recording(Visibility::Public);
        r.hidden = true;
        assert_eq!(
            can_view_recording(&r, &Requester::anonymous(), MembershipTier::Member),
            AccessDecision::Denied(DenialReason::NotFound)
        );
    }

    #[test]
    fn orphan_recording_has_no_owner_to_match() {
        let mut r = recording(Visibility::Private);
        r.creator_id = None;
        assert_eq!(
            can_view_recording(&r, &member(MembershipTier::Premium), MembershipTier::Member),
            AccessDecision::Denied(DenialReason::NotFound)
        );
    }
}
