use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Teacher,
    Institution,
    Admin,
}

impl Role {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Some(Self::Student),
            "teacher" => Some(Self::Teacher),
            "institution" => Some(Self::Institution),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Student => "student",
            Self::Teacher => "teacher",
            Self::Institution => "institution",
            Self::Admin => "admin",
        }
    }
}

/// Who is asking. Passed explicitly with every tenant-scoped request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub role: Role,
    pub institution_id: Option<String>,
    pub name: Option<String>,
}

impl Caller {
    /// Owning institution. An institution account is its own tenant.
    pub fn tenant(&self) -> &str {
        self.institution_id
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.user_id)
    }

    pub fn is_staff(&self) -> bool {
        matches!(self.role, Role::Institution | Role::Admin)
    }
}

/// Documents owned through the tenant field.
pub const OWNED_BY_INSTITUTION: &str = "institution_id = ?1";

/// Documents owned through the legacy creator field. A document stamped with
/// another institution never qualifies, whoever created it.
pub const OWNED_BY_CREATOR: &str =
    "created_by = ?1 AND (institution_id IS NULL OR institution_id = '' OR institution_id = ?1)";

/// Union of the two ownership query results, one entry per document id,
/// in id order.
pub fn merge_by_id<T, F>(first: Vec<T>, second: Vec<T>, id: F) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    let mut merged: BTreeMap<String, T> = BTreeMap::new();
    for item in first.into_iter().chain(second) {
        let key = id(&item).to_string();
        merged.entry(key).or_insert(item);
    }
    merged.into_values().collect()
}
