use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{TeamId, TlfType, UserId};

/// Names the set of users (or the team) a folder belongs to.
///
/// Writer and reader lists are kept sorted and deduplicated so that equal
/// handles have equal canonical names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TlfHandle {
    pub tlf_type: TlfType,
    pub writers: Vec<UserId>,
    pub readers: Vec<UserId>,
    pub team: Option<TeamId>,
}

impl TlfHandle {
    pub fn private(writers: impl IntoIterator<Item = UserId>, readers: impl IntoIterator<Item = UserId>) -> Self {
        let writers = normalize(writers);
        let readers = normalize(readers)
            .into_iter()
            .filter(|r| !writers.contains(r))
            .collect();
        Self {
            tlf_type: TlfType::Private,
            writers,
            readers,
            team: None,
        }
    }

    pub fn public(writers: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            tlf_type: TlfType::Public,
            writers: normalize(writers),
            readers: Vec::new(),
            team: None,
        }
    }

    pub fn team(team: TeamId) -> Self {
        Self {
            tlf_type: TlfType::SingleTeam,
            writers: Vec::new(),
            readers: Vec::new(),
            team: Some(team),
        }
    }

    /// `alice,bob#carol` for user folders, the team name for team folders.
    pub fn canonical_name(&self) -> String {
        if let Some(team) = &self.team {
            return team.0.clone();
        }
        let writers: Vec<&str> = self.writers.iter().map(|u| u.0.as_str()).collect();
        let mut name = writers.join(",");
        if !self.readers.is_empty() {
            let readers: Vec<&str> = self.readers.iter().map(|u| u.0.as_str()).collect();
            name.push('#');
            name.push_str(&readers.join(","));
        }
        name
    }

    /// Key under which the store indexes this handle.
    pub fn store_key(&self) -> String {
        format!("{}/{}", self.tlf_type, self.canonical_name())
    }

    /// Membership for user folders. Team folders answer through the
    /// identity layer instead.
    pub fn is_writer(&self, uid: &UserId) -> bool {
        self.writers.contains(uid)
    }

    pub fn is_reader(&self, uid: &UserId) -> bool {
        self.tlf_type == TlfType::Public || self.is_writer(uid) || self.readers.contains(uid)
    }
}

impl fmt::Display for TlfHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tlf_type, self.canonical_name())
    }
}

fn normalize(users: impl IntoIterator<Item = UserId>) -> Vec<UserId> {
    let mut users: Vec<UserId> = users.into_iter().collect();
    users.sort();
    users.dedup();
    users
}
