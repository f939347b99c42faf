//! crates/fee_portal_core/src/roster.rs
//!
//! The read-only roster projection computed from a cached student collection.

use std::str::FromStr;

use crate::domain::Student;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StatusFilter {
    #[default]
    All,
    Paid,
    Unpaid,
}

impl StatusFilter {
    pub fn matches(&self, student: &Student) -> bool {
        match self {
            StatusFilter::All => true,
            StatusFilter::Paid => student.fees_paid,
            StatusFilter::Unpaid => !student.fees_paid,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StatusFilter::All => "all",
            StatusFilter::Paid => "paid",
            StatusFilter::Unpaid => "unpaid",
        }
    }
}

impl FromStr for StatusFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(StatusFilter::All),
            "paid" => Ok(StatusFilter::Paid),
            "unpaid" => Ok(StatusFilter::Unpaid),
            other => Err(format!("unknown status filter '{}'", other)),
        }
    }
}

/// Rows whose name or email contains `search` (case-insensitive) and whose
/// payment flag satisfies `filter`, in cache order.
pub fn project<'a>(rows: &'a [Student], search: &str, filter: StatusFilter) -> Vec<&'a Student> {
    let needle = search.to_lowercase();
    rows.iter()
        .filter(|student| {
            student.name.to_lowercase().contains(&needle)
                || student.email.to_lowercase().contains(&needle)
        })
        .filter(|student| filter.matches(student))
        .collect()
}

/// Header counts over the whole cache, independent of the current filter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RosterStats {
    pub total: usize,
    pub paid: usize,
    pub unpaid: usize,
}

impl RosterStats {
    pub fn from_rows(rows: &[Student]) -> Self {
        let paid = rows.iter().filter(|s| s.fees_paid).count();
        Self {
            total: rows.len(),
            paid,
            unpaid: rows.len() - paid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn student(name: &str, email: &str, fees_paid: bool) -> Student {
        let now = Utc::now();
        Student {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: name.to_string(),
            email: email.to_string(),
            fees_paid,
            created_at: now,
            updated_at: now,
        }
    }

    fn roster() -> Vec<Student> {
        vec![
            student("Ana", "ana@school.edu", true),
            student("Bo", "bo@school.edu", false),
            student("Dana", "d.k@campus.org", false),
        ]
    }

    #[test]
    fn search_is_case_insensitive_over_name_and_email() {
        let rows = roster();
        let names: Vec<_> = project(&rows, "AN", StatusFilter::All)
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["Ana", "Dana"]);

        let by_email = project(&rows, "campus", StatusFilter::All);
        assert_eq!(by_email.len(), 1);
        assert_eq!(by_email[0].name, "Dana");
    }

    #[test]
    fn status_filter_combines_with_search() {
        let rows = roster();
        let unpaid: Vec<_> = project(&rows, "", StatusFilter::Unpaid)
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(unpaid, vec!["Bo", "Dana"]);
        assert_eq!(project(&rows, "an", StatusFilter::Paid).len(), 1);
    }

    #[test]
    fn projection_is_deterministic() {
        let rows = roster();
        let first = project(&rows, "a", StatusFilter::Unpaid);
        let second = project(&rows, "a", StatusFilter::Unpaid);
        assert_eq!(first, second);
        assert!(project(&rows, "zzz", StatusFilter::All).is_empty());
    }

    #[test]
    fn stats_count_the_whole_cache() {
        let stats = RosterStats::from_rows(&roster());
        assert_eq!(
            stats,
            RosterStats {
                total: 3,
                paid: 1,
                unpaid: 2
            }
        );
    }

    #[test]
    fn filter_parses_known_values() {
        assert_eq!("unpaid".parse::<StatusFilter>(), Ok(StatusFilter::Unpaid));
        assert!("owing".parse::<StatusFilter>().is_err());
    }
}
