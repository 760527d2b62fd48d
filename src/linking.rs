use crate::accounts::{self, Account};
use crate::classkey::{class_variants, normalize_section};
use crate::names::{match_names, MatchTier};
use crate::roster::{self, Allotment, RosterKind};
use crate::tenancy::Role;
use anyhow::Context;
use rusqlite::Connection;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkScope {
    Teacher,
    Student,
    All,
}

impl LinkScope {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Some(Self::All),
            other => RosterKind::parse(other).map(|k| match k {
                RosterKind::Teacher => Self::Teacher,
                RosterKind::Student => Self::Student,
            }),
        }
    }

    fn kinds(self) -> &'static [RosterKind] {
        match self {
            Self::Teacher => &[RosterKind::Teacher],
            Self::Student => &[RosterKind::Student],
            Self::All => &[RosterKind::Teacher, RosterKind::Student],
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkNote {
    pub allotment_id: String,
    pub name: String,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkReport {
    pub scanned: usize,
    pub linked: usize,
    pub already_linked: usize,
    pub ambiguous: usize,
    pub unmatched: usize,
    pub mismatched: usize,
    pub notes: Vec<LinkNote>,
}

enum Candidate<'a> {
    Unique(&'a Account, MatchTier),
    Ambiguous(Vec<&'a Account>),
    None,
}

fn eligible(kind: RosterKind, row: &Allotment, account: &Account) -> bool {
    match kind {
        RosterKind::Teacher => account.role == Role::Teacher,
        RosterKind::Student => {
            if account.role != Role::Student {
                return false;
            }
            let Some(class_name) = account.class_name.as_deref() else {
                return false;
            };
            let same_section = account
                .section
                .as_deref()
                .is_some_and(|s| normalize_section(s) == normalize_section(&row.section));
            same_section
                && class_variants(&row.class_assigned)
                    .iter()
                    .any(|v| v.eq_ignore_ascii_case(class_name.trim()))
        }
    }
}

/// The strongest name tier wins; two accounts sharing it are ambiguous.
fn best_candidate<'a>(kind: RosterKind, row: &Allotment, pool: &'a [Account]) -> Candidate<'a> {
    let scored: Vec<(&Account, MatchTier)> = pool
        .iter()
        .filter(|a| eligible(kind, row, a))
        .filter_map(|a| match_names(&a.name, &row.name).map(|t| (a, t)))
        .collect();
    let Some(best) = scored.iter().map(|(_, t)| *t).min() else {
        return Candidate::None;
    };
    let top: Vec<&Account> = scored
        .into_iter()
        .filter(|(_, t)| *t == best)
        .map(|(a, _)| a)
        .collect();
    match top.as_slice() {
        [one] => Candidate::Unique(*one, best),
        _ => Candidate::Ambiguous(top),
    }
}

/// Backfills missing `user_id`s on the given rows. Linked rows are never
/// rewritten; a disagreeing link is only reported. Running it twice writes
/// nothing the second time.
pub fn reconcile_rows(conn: &Connection, rows: &[Allotment], pool: &[Account]) -> anyhow::Result<LinkReport> {
    let mut report = LinkReport::default();
    for row in rows {
        report.scanned += 1;
        let candidate = best_candidate(row.kind, row, pool);

        if row.is_linked() {
            let current = row.user_id.as_deref().unwrap_or_default();
            match candidate {
                Candidate::Unique(acc, _) if acc.id != current => {
                    tracing::warn!(
                        allotment = %row.id,
                        linked = current,
                        candidate = %acc.id,
                        "allotment linked to a different account than its name suggests"
                    );
                    report.mismatched += 1;
                    report.notes.push(LinkNote {
                        allotment_id: row.id.clone(),
                        name: row.name.clone(),
                        outcome: "mismatched",
                        candidates: vec![acc.id.clone()],
                    });
                }
                _ => report.already_linked += 1,
            }
            continue;
        }

        match candidate {
            Candidate::Unique(acc, tier) => {
                let wrote = roster::backfill_user_id(conn, row.kind, &row.id, &acc.id)
                    .with_context(|| format!("backfill user id on {}", row.id))?;
                if wrote {
                    tracing::info!(allotment = %row.id, account = %acc.id, tier = ?tier, "allotment linked");
                    report.linked += 1;
                } else {
                    report.already_linked += 1;
                }
            }
            Candidate::Ambiguous(accs) => {
                tracing::debug!(allotment = %row.id, count = accs.len(), "ambiguous link candidates");
                report.ambiguous += 1;
                report.notes.push(LinkNote {
                    allotment_id: row.id.clone(),
                    name: row.name.clone(),
                    outcome: "ambiguous",
                    candidates: accs.iter().map(|a| a.id.clone()).collect(),
                });
            }
            Candidate::None => report.unmatched += 1,
        }
    }
    Ok(report)
}

/// Full pass over the tenant's rosters.
pub fn reconcile_tenant(conn: &Connection, tenant: &str, scope: LinkScope) -> anyhow::Result<LinkReport> {
    let pool = accounts::list(conn, tenant, None).context("load accounts")?;
    let mut rows = Vec::new();
    for kind in scope.kinds() {
        rows.extend(roster::list_for_tenant(conn, *kind, tenant).context("load allotments")?);
    }
    let report = reconcile_rows(conn, &rows, &pool)?;
    tracing::info!(
        tenant,
        scanned = report.scanned,
        linked = report.linked,
        ambiguous = report.ambiguous,
        "link reconcile finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountInput;
    use crate::db::open_db;
    use crate::roster::NewAllotment;

    fn temp_conn() -> Connection {
        let dir = std::env::temp_dir().join(format!("rosterd-link-{}", uuid::Uuid::new_v4()));
        open_db(&dir).expect("open db")
    }

    fn account(conn: &Connection, id: &str, role: &str, name: &str, class: Option<&str>, section: Option<&str>) {
        accounts::upsert(
            conn,
            "inst",
            &AccountInput {
                id: Some(id.into()),
                role: Some(role.into()),
                name: name.into(),
                class_name: class.map(str::to_string),
                section: section.map(str::to_string),
                subject: None,
                email: None,
            },
        )
        .expect("account");
    }

    fn allot(conn: &Connection, kind: RosterKind, name: &str, class: &str, detail: &str) -> Allotment {
        roster::insert(
            conn,
            "inst",
            "inst",
            &NewAllotment {
                kind,
                name: name.into(),
                class_assigned: class.into(),
                section: "A".into(),
                detail: detail.into(),
                user_id: None,
            },
            false,
        )
        .expect("allot")
    }

    #[test]
    fn second_pass_writes_nothing() {
        let conn = temp_conn();
        account(&conn, "u-mary", "teacher", "Mary Joseph", None, None);
        account(&conn, "u-ravi", "student", "Ravi Kumar", Some("Class 7"), Some("a"));
        let t = allot(&conn, RosterKind::Teacher, "mary joseph", "7", "Maths");
        allot(&conn, RosterKind::Student, "Ravi Kumar", "7th", "12");

        let first = reconcile_tenant(&conn, "inst", LinkScope::All).expect("first");
        assert_eq!(first.linked, 2);
        let second = reconcile_tenant(&conn, "inst", LinkScope::All).expect("second");
        assert_eq!(second.linked, 0);
        assert_eq!(second.already_linked, 2);

        let row = roster::get(&conn, RosterKind::Teacher, "inst", &t.id).expect("get").expect("row");
        assert_eq!(row.user_id.as_deref(), Some("u-mary"));
    }

    #[test]
    fn ties_at_the_best_tier_are_left_alone() {
        let conn = temp_conn();
        account(&conn, "u1", "teacher", "Anita Sharma", None, None);
        account(&conn, "u2", "teacher", "Anita Verma", None, None);
        let t = allot(&conn, RosterKind::Teacher, "Anita", "8", "Art");

        let report = reconcile_tenant(&conn, "inst", LinkScope::Teacher).expect("reconcile");
        assert_eq!(report.ambiguous, 1);
        assert_eq!(report.linked, 0);
        let row = roster::get(&conn, RosterKind::Teacher, "inst", &t.id).expect("get").expect("row");
        assert!(row.user_id.is_none());
    }

    #[test]
    fn students_in_another_section_do_not_match() {
        let conn = temp_conn();
        account(&conn, "u1", "student", "Ravi Kumar", Some("7"), Some("B"));
        allot(&conn, RosterKind::Student, "Ravi Kumar", "7", "12");
        let report = reconcile_tenant(&conn, "inst", LinkScope::Student).expect("reconcile");
        assert_eq!(report.unmatched, 1);
    }
}
