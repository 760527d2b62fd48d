use crate::names::{case_variants, name_is_token_of};
use crate::roster::{self, Allotment, RosterKind};
use crate::schedule::{covered_period_ids, default_periods, Cell, Period, Schedule};
use crate::timetables::{self, TimetableDoc};
use anyhow::Context;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashSet;

/// Which lookup found the teacher's allotments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FoundBy {
    UserId,
    Name,
    NameVariant,
    NameToken,
    Nothing,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonalWeek {
    pub periods: Vec<Period>,
    pub schedule: Schedule,
    pub allotment_count: usize,
    pub found_by: FoundBy,
}

/// Picks the teacher's allotments, trying each lookup only when the previous
/// one found nothing.
pub fn teacher_allotments<'a>(
    rows: &'a [Allotment],
    user_id: &str,
    name: Option<&str>,
) -> (Vec<&'a Allotment>, FoundBy) {
    let by_id: Vec<&Allotment> = rows
        .iter()
        .filter(|a| a.user_id.as_deref() == Some(user_id))
        .collect();
    if !by_id.is_empty() {
        return (by_id, FoundBy::UserId);
    }
    let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) else {
        return (Vec::new(), FoundBy::Nothing);
    };

    let exact: Vec<&Allotment> = rows.iter().filter(|a| a.name == name).collect();
    if !exact.is_empty() {
        return (exact, FoundBy::Name);
    }
    for variant in case_variants(name).into_iter().skip(1) {
        let hits: Vec<&Allotment> = rows.iter().filter(|a| a.name == variant).collect();
        if !hits.is_empty() {
            return (hits, FoundBy::NameVariant);
        }
    }
    let loose: Vec<&Allotment> = rows
        .iter()
        .filter(|a| name_is_token_of(name, &a.name))
        .collect();
    if loose.is_empty() {
        (loose, FoundBy::Nothing)
    } else {
        (loose, FoundBy::NameToken)
    }
}

/// Where a period of some class lands on the default grid: same name, then
/// same id, then same position.
fn target_period<'a>(grid: &'a [Period], periods: &[Period], period_id: &str) -> Option<&'a Period> {
    let index = periods.iter().position(|p| p.id == period_id);
    let by_name = index
        .map(|i| periods[i].name.as_str())
        .and_then(|name| grid.iter().find(|g| g.name == name));
    by_name
        .or_else(|| grid.iter().find(|g| g.id.eq_ignore_ascii_case(period_id)))
        .or_else(|| index.and_then(|i| grid.get(i)))
}

fn cell_is_mine(text: &str, name: Option<&str>, subjects: &[String]) -> bool {
    let text = text.trim().to_lowercase();
    if text.is_empty() {
        return false;
    }
    let by_name = name
        .map(|n| n.trim().to_lowercase())
        .is_some_and(|n| !n.is_empty() && text.contains(&n));
    by_name
        || subjects
            .iter()
            .any(|s| !s.is_empty() && (text.contains(s.as_str()) || s.contains(text.as_str())))
}

/// Folds matching cells of every class the teacher is allotted to onto the
/// default grid. Colliding entries stack one per line; the widest span wins.
pub fn aggregate(
    allotments: &[&Allotment],
    docs: &[TimetableDoc],
    name: Option<&str>,
    profile_subject: Option<&str>,
) -> Schedule {
    let grid = default_periods();
    let mut out = Schedule::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for doc in docs {
        let mine: Vec<&&Allotment> = allotments
            .iter()
            .filter(|a| doc.matches(&a.class_assigned, &a.section))
            .collect();
        if mine.is_empty() || !seen.insert(doc.id.as_str()) {
            continue;
        }
        let subjects: Vec<String> = mine
            .iter()
            .filter_map(|a| a.subject.as_deref().or(profile_subject))
            .map(|s| s.trim().to_lowercase())
            .collect();

        for (day, row) in &doc.schedule {
            let covered = covered_period_ids(&doc.periods, row);
            for (period_id, cell) in row {
                if covered.contains(period_id) || !cell_is_mine(&cell.subject, name, &subjects) {
                    continue;
                }
                let Some(target) = target_period(&grid, &doc.periods, period_id) else {
                    continue;
                };
                let entry = format!("{}-{} ({})", doc.class_name, doc.section, cell.subject);
                let slot = out.entry(day.clone()).or_default();
                match slot.get_mut(&target.id) {
                    Some(existing) => {
                        existing.subject = format!("{}\n{}", existing.subject, entry);
                        existing.span = existing.span.max(cell.span);
                    }
                    None => {
                        slot.insert(
                            target.id.clone(),
                            Cell {
                                subject: entry,
                                span: cell.span.max(1),
                                conflict: false,
                            },
                        );
                    }
                }
            }
        }
    }
    out
}

pub fn personal_week(
    conn: &Connection,
    tenant: &str,
    user_id: &str,
    name: Option<&str>,
    profile_subject: Option<&str>,
) -> anyhow::Result<PersonalWeek> {
    let rows = roster::list_for_tenant(conn, RosterKind::Teacher, tenant).context("load teacher allotments")?;
    let (mine, found_by) = teacher_allotments(&rows, user_id, name);
    let schedule = if mine.is_empty() {
        Schedule::new()
    } else {
        let docs = timetables::list_for_tenant(conn, tenant).context("load timetables")?;
        aggregate(&mine, &docs, name, profile_subject)
    };
    tracing::debug!(user = user_id, allotments = mine.len(), found_by = ?found_by, "personal timetable built");
    Ok(PersonalWeek {
        periods: default_periods(),
        schedule,
        allotment_count: mine.len(),
        found_by,
    })
}
