// ============================
// crates/backend-lib/src/filter.rs
// ============================
//! Filter predicate deciding whether two waiting users may be paired.
//!
//! Every dimension of [`MatchFilters`] is an allow-list; an empty list
//! accepts anything. Filters are one-sided, so a pair is only formed when
//! each side accepts the other's profile.

use protv_common::{MatchFilters, Profile};

/// Whether `filters` accept `profile` on every restricted dimension
pub fn accepts(filters: &MatchFilters, profile: &Profile) -> bool {
    if !filters.schools.is_empty() && !filters.schools.contains(&profile.school) {
        return false;
    }

    if !filters.class_years.is_empty() && !filters.class_years.contains(&profile.class_year) {
        return false;
    }

    if !filters.majors.is_empty() {
        let major = profile.major.trim();
        if !filters
            .majors
            .iter()
            .any(|m| m.trim().eq_ignore_ascii_case(major))
        {
            return false;
        }
    }

    true
}

/// Both sides accept each other
pub fn mutually_compatible(
    a_filters: &MatchFilters,
    a_profile: &Profile,
    b_filters: &MatchFilters,
    b_profile: &Profile,
) -> bool {
    accepts(a_filters, b_profile) && accepts(b_filters, a_profile)
}
