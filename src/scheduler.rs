use crate::names::{match_names, MatchTier};
use crate::schedule::{
    annotated_names, canonical_day, cell_text, covered_period_ids, Cell, Period, Schedule,
    BREAK_CELL, DAYS,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ScheduleError {
    #[error("at least one subject is required")]
    NoSubjects,
    #[error("no class periods to fill")]
    NoClassPeriods,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeacherRef {
    /// Stable key: the linked account id when known, else the allotment id.
    pub key: String,
    pub name: String,
}

/// teacher key -> day -> occupied period ids, taken from other classes.
#[derive(Debug, Default, Clone)]
pub struct BusyMap {
    slots: HashMap<String, HashMap<String, HashSet<String>>>,
}

impl BusyMap {
    pub fn is_busy(&self, teacher: &str, day: &str, period_id: &str) -> bool {
        self.slots
            .get(teacher)
            .and_then(|days| days.get(day))
            .map(|p| p.contains(period_id))
            .unwrap_or(false)
    }

    pub fn mark(&mut self, teacher: &str, day: &str, period_id: &str) {
        self.slots
            .entry(teacher.to_string())
            .or_default()
            .entry(day.to_string())
            .or_default()
            .insert(period_id.to_string());
    }

    #[cfg(test)]
    pub fn booked_count(&self, teacher: &str) -> usize {
        self.slots
            .get(teacher)
            .map(|d| d.values().map(HashSet::len).sum())
            .unwrap_or(0)
    }

    /// Scans other classes' grids and attributes each parenthesised name to
    /// the configured teacher it names. A spanning cell books every period it covers.
    pub fn from_timetables<'a, I>(timetables: I, teachers: &[TeacherRef]) -> Self
    where
        I: IntoIterator<Item = (&'a [Period], &'a Schedule)>,
    {
        let mut busy = BusyMap::default();
        for (periods, schedule) in timetables {
            for (day_raw, row) in schedule {
                let Some(day) = canonical_day(day_raw) else {
                    continue;
                };
                let covered = covered_period_ids(periods, row);
                for (idx, period) in periods.iter().enumerate() {
                    if covered.contains(&period.id) {
                        continue;
                    }
                    let Some(cell) = row.get(&period.id) else {
                        continue;
                    };
                    for name in annotated_names(&cell.subject) {
                        for t in teachers {
                            let strong = matches!(
                                match_names(&name, &t.name),
                                Some(MatchTier::Exact | MatchTier::Contains)
                            );
                            if !strong {
                                continue;
                            }
                            for p in periods.iter().skip(idx).take(cell.span.max(1) as usize) {
                                busy.mark(&t.key, day, &p.id);
                            }
                        }
                    }
                }
            }
        }
        busy
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub subjects: Vec<String>,
    /// subject -> bound teacher
    pub assignments: HashMap<String, TeacherRef>,
    pub periods: Vec<Period>,
    pub mark_conflicts: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub day: String,
    pub period_id: String,
    pub subject: String,
    pub teacher: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectUsage {
    pub subject: String,
    pub count: usize,
}

#[derive(Debug, Clone)]
pub struct GeneratedGrid {
    pub periods: Vec<Period>,
    pub schedule: Schedule,
    pub usage: Vec<SubjectUsage>,
    pub conflicts: Vec<Conflict>,
    /// subject -> teacher for every subject that landed in the grid
    pub teachers_used: BTreeMap<String, TeacherRef>,
}

fn dedup_subjects(raw: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for s in raw {
        let t = s.trim();
        if !t.is_empty() && !out.iter().any(|o| o.eq_ignore_ascii_case(t)) {
            out.push(t.to_string());
        }
    }
    out
}

/// Greedy single pass, Monday to Saturday, period by period. No backtracking.
///
/// Per class period: least-used subjects first (input order breaks ties),
/// skipping the subject of the preceding class period, taking the first whose
/// teacher is free. When nothing qualifies the repeat rule is dropped, and as
/// a last resort the least-used subject is placed even though its teacher is
/// booked elsewhere; that placement is reported as a conflict.
pub fn generate(config: &GeneratorConfig, busy: &mut BusyMap) -> Result<GeneratedGrid, ScheduleError> {
    let subjects = dedup_subjects(&config.subjects);
    if subjects.is_empty() {
        return Err(ScheduleError::NoSubjects);
    }
    if config.periods.iter().all(Period::is_break) {
        return Err(ScheduleError::NoClassPeriods);
    }

    let teacher_of = |i: usize| -> Option<&TeacherRef> {
        config.assignments.get(&subjects[i]).or_else(|| {
            config
                .assignments
                .iter()
                .find(|(k, _)| k.trim().eq_ignore_ascii_case(&subjects[i]))
                .map(|(_, t)| t)
        })
    };

    let mut usage = vec![0usize; subjects.len()];
    let mut schedule = Schedule::new();
    let mut conflicts = Vec::new();
    let mut teachers_used = BTreeMap::new();

    for day in DAYS {
        let row = schedule.entry(day.to_string()).or_default();
        let mut prev: Option<usize> = None;

        for period in &config.periods {
            if period.is_break() {
                row.insert(period.id.clone(), Cell::text(BREAK_CELL));
                continue;
            }

            let mut ranked: Vec<usize> = (0..subjects.len()).collect();
            ranked.sort_by_key(|&i| usage[i]);

            let is_free = |i: usize| {
                teacher_of(i)
                    .map(|t| !busy.is_busy(&t.key, day, &period.id))
                    .unwrap_or(true)
            };

            let pick = ranked
                .iter()
                .copied()
                .filter(|&i| Some(i) != prev)
                .find(|&i| is_free(i))
                .or_else(|| ranked.iter().copied().find(|&i| is_free(i)))
                .unwrap_or(ranked[0]);

            let teacher = teacher_of(pick).cloned();
            let mut cell = Cell::text(cell_text(
                &subjects[pick],
                teacher.as_ref().map(|t| t.name.as_str()),
            ));

            if let Some(t) = &teacher {
                if busy.is_busy(&t.key, day, &period.id) {
                    conflicts.push(Conflict {
                        day: day.to_string(),
                        period_id: period.id.clone(),
                        subject: subjects[pick].clone(),
                        teacher: t.name.clone(),
                    });
                    cell.conflict = config.mark_conflicts;
                }
                busy.mark(&t.key, day, &period.id);
                teachers_used
                    .entry(subjects[pick].clone())
                    .or_insert_with(|| t.clone());
            }

            row.insert(period.id.clone(), cell);
            usage[pick] += 1;
            prev = Some(pick);
        }
    }

    let usage = subjects
        .iter()
        .zip(usage)
        .map(|(s, count)| SubjectUsage {
            subject: s.clone(),
            count,
        })
        .collect();

    Ok(GeneratedGrid {
        periods: config.periods.clone(),
        schedule,
        usage,
        conflicts,
        teachers_used,
    })
}
