//! Turn state, roster and speaker/listener policy
//!
//! The authoritative game state lives on the server. Participants only
//! observe it through `turnUpdate` and `roomUpdate` messages, so everything
//! here is a read-only snapshot plus the pure rules that decide who may
//! transmit and who may hear.

use serde::{Deserialize, Serialize};

/// Team identifier (e.g. "team1", "team2")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TeamId(pub String);

impl TeamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TeamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Phase of the current turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// No game running
    #[default]
    Idle,
    /// Countdown before a turn; nobody transmits
    Preparation,
    /// Turn in progress; the speaker may transmit
    Active,
}

/// Snapshot of the turn as announced by the game server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TurnContext {
    #[serde(default)]
    pub active_team: Option<TeamId>,
    #[serde(default)]
    pub speaker_identity: Option<String>,
    #[serde(default)]
    pub phase: Phase,
}

impl TurnContext {
    /// An active turn for `team` with an announced speaker
    pub fn active(team: TeamId, speaker: impl Into<String>) -> Self {
        Self {
            active_team: Some(team),
            speaker_identity: Some(speaker.into()),
            phase: Phase::Active,
        }
    }
}

/// One roster entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub identity: String,
    #[serde(default)]
    pub team: Option<TeamId>,
}

/// Ordered room roster (join order is preserved)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Roster {
    entries: Vec<RosterEntry>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the roster with a server snapshot
    pub fn apply_snapshot(&mut self, participants: Vec<RosterEntry>) {
        self.entries.clear();
        for entry in participants {
            self.join(entry.identity, entry.team);
        }
    }

    /// Add a participant, or update the team of an existing one
    pub fn join(&mut self, identity: impl Into<String>, team: Option<TeamId>) {
        let identity = identity.into();
        match self.entries.iter_mut().find(|e| e.identity == identity) {
            Some(entry) => {
                if team.is_some() {
                    entry.team = team;
                }
            }
            None => self.entries.push(RosterEntry { identity, team }),
        }
    }

    /// Remove a participant. Returns true if it was present.
    pub fn leave(&mut self, identity: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.identity != identity);
        self.entries.len() != before
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.entries.iter().any(|e| e.identity == identity)
    }

    pub fn team_of(&self, identity: &str) -> Option<&TeamId> {
        self.entries
            .iter()
            .find(|e| e.identity == identity)
            .and_then(|e| e.team.as_ref())
    }

    /// All identities in join order
    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.identity.as_str())
    }

    /// Members of a team in join order
    pub fn members_of<'a>(&'a self, team: &'a TeamId) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.team.as_ref() == Some(team))
            .map(|e| e.identity.as_str())
    }

    pub fn entries(&self) -> &[RosterEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// How the current speaker is determined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpeakerRule {
    /// Only the identity announced in `speakerIdentity` speaks
    #[default]
    Announced,
    /// The announced identity if any, otherwise the first member (join
    /// order) of the active team
    FirstOfTeam,
}

/// Who may hear the speaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ListenerScope {
    /// Members of the active team other than the speaker
    #[default]
    Teammates,
    /// Everyone in the room other than the speaker
    Room,
}

/// Speaker and listener rules applied to a turn snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TurnPolicy {
    pub speaker_rule: SpeakerRule,
    pub listener_scope: ListenerScope,
}

impl TurnPolicy {
    /// Identity allowed to transmit right now, if any
    ///
    /// Returns `None` outside the `Active` phase.
    pub fn effective_speaker<'a>(
        &self,
        turn: &'a TurnContext,
        roster: &'a Roster,
    ) -> Option<&'a str> {
        if turn.phase != Phase::Active {
            return None;
        }
        if let Some(speaker) = turn.speaker_identity.as_deref() {
            return Some(speaker);
        }
        match self.speaker_rule {
            SpeakerRule::Announced => None,
            SpeakerRule::FirstOfTeam => {
                let team = turn.active_team.as_ref()?;
                roster.members_of(team).next()
            }
        }
    }

    /// Whether `identity` may capture and transmit
    pub fn can_transmit(&self, identity: &str, turn: &TurnContext, roster: &Roster) -> bool {
        self.effective_speaker(turn, roster) == Some(identity)
    }

    /// Whether `listener` may hear audio from `sender`
    ///
    /// The sender must be the effective speaker and the listener must be in
    /// the policy's listener set. Nobody hears themselves.
    pub fn can_receive(
        &self,
        listener: &str,
        sender: &str,
        turn: &TurnContext,
        roster: &Roster,
    ) -> bool {
        if listener == sender || self.effective_speaker(turn, roster) != Some(sender) {
            return false;
        }
        match self.listener_scope {
            ListenerScope::Room => true,
            ListenerScope::Teammates => match turn.active_team.as_ref() {
                Some(team) => roster.team_of(listener) == Some(team),
                None => false,
            },
        }
    }

    /// Identities that should receive the current speaker's frames
    pub fn eligible_listeners(&self, turn: &TurnContext, roster: &Roster) -> Vec<String> {
        let Some(speaker) = self.effective_speaker(turn, roster) else {
            return Vec::new();
        };
        roster
            .identities()
            .filter(|id| self.can_receive(id, speaker, turn, roster))
            .map(str::to_string)
            .collect()
    }
}
