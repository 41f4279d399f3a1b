//! Page validation (§4.9).
//!
//! Given the fields parsed out of an extent descriptor plus the page's
//! declared `entries`, decide whether the page can be trusted and, if
//! some of its fields are merely inconsistent rather than corrupt,
//! normalize them.

use crate::common::{PageType, TimestampS};

#[derive(Debug, Clone, Copy)]
pub struct PageValidationInput {
    pub start_s: TimestampS,
    pub end_s: TimestampS,
    pub update_every_s: Option<u32>,
    pub length: usize,
    pub page_type: Option<PageType>,
    pub entries: u32,
    pub now_s: Option<TimestampS>,
    pub overwrite_zero_update_every: bool,
    pub have_read_error: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct PageValidationOutput {
    pub end_s: TimestampS,
    pub update_every_s: u32,
    pub entries: u32,
}

/// Validates (and, where possible, normalizes) a page's framing fields.
///
/// Returns `None` when the page must be rejected outright (the caller
/// should deliver `PGD_EMPTY` / mark the page invalid); `Some` carries
/// the normalized `(end_s, update_every_s, entries)` otherwise.
pub fn validate_page(input: PageValidationInput) -> Option<PageValidationOutput> {
    let PageValidationInput {
        start_s,
        end_s,
        update_every_s,
        length,
        page_type,
        entries,
        now_s,
        overwrite_zero_update_every,
        have_read_error,
    } = input;

    let page_type = page_type?;
    if have_read_error {
        return None;
    }
    if length == 0 || length > crate::page::Page::max_page_length(page_type, entries.max(1)) {
        return None;
    }
    if start_s > end_s || start_s <= 0 || end_s <= 0 {
        return None;
    }
    if let Some(now) = now_s {
        if end_s > now {
            return None;
        }
    }
    if start_s == end_s && entries > 1 {
        return None;
    }
    if update_every_s == Some(0) && entries > 1 {
        return None;
    }

    let mut end_s = end_s;
    let update_every_s = match update_every_s {
        Some(u) if u > 0 => u,
        _ => {
            // Derive from entries and the time span.
            if entries > 1 {
                ((end_s - start_s) / (entries as i64 - 1)).max(1) as u32
            } else {
                1
            }
        }
    };

    // entries should roughly equal (end - start) / update_every + 1; if it
    // disagrees, clamp using the overwrite hint, preferring to reduce
    // `end_s` when the implied end-time decreases.
    let implied_entries = if update_every_s > 0 {
        ((end_s - start_s) / update_every_s as i64 + 1).max(1) as u32
    } else {
        entries
    };

    let entries = if implied_entries != entries && overwrite_zero_update_every {
        let implied_end = start_s + (entries as i64 - 1) * update_every_s as i64;
        if implied_end < end_s {
            end_s = implied_end;
        }
        entries
    } else {
        implied_entries
    };

    Some(PageValidationOutput {
        end_s,
        update_every_s,
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> PageValidationInput {
        PageValidationInput {
            start_s: 1000,
            end_s: 1059,
            update_every_s: Some(1),
            length: 60 * 4,
            page_type: Some(PageType::Array32),
            entries: 60,
            now_s: None,
            overwrite_zero_update_every: true,
            have_read_error: false,
        }
    }

    #[test]
    fn accepts_well_formed_page() {
        let out = validate_page(base()).unwrap();
        assert_eq!(out.end_s, 1059);
        assert_eq!(out.update_every_s, 1);
        assert_eq!(out.entries, 60);
    }

    #[test]
    fn rejects_read_error() {
        let mut input = base();
        input.have_read_error = true;
        assert!(validate_page(input).is_none());
    }

    #[test]
    fn rejects_future_end_time() {
        let mut input = base();
        input.now_s = Some(1000);
        assert!(validate_page(input).is_none());
    }

    #[test]
    fn rejects_single_point_with_span() {
        let mut input = base();
        input.entries = 1;
        input.end_s = 2000;
        // start != end but entries == 1 is fine; only start == end && entries > 1 is rejected.
        assert!(validate_page(input).is_some());
    }

    #[test]
    fn derives_update_every_when_absent() {
        let mut input = base();
        input.update_every_s = None;
        let out = validate_page(input).unwrap();
        assert_eq!(out.update_every_s, 1);
    }

    #[test]
    fn rejects_zero_length() {
        let mut input = base();
        input.length = 0;
        assert!(validate_page(input).is_none());
    }
}
