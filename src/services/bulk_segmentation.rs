//! Groups per-page name detections of a bulk scan into reviewable
//! per-student page ranges.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use similar::TextDiff;
use thiserror::Error;
use uuid::Uuid;

use crate::db::models::NameEvidence;

pub(crate) const UNKNOWN_STUDENT: &str = "Unknown Student";
pub(crate) const DEFAULT_NAME_MATCH_THRESHOLD: f64 = 0.65;
pub(crate) const DEFAULT_MAX_CARRY_FORWARD_PAGES: usize = 2;
pub(crate) const INCOMPLETE_COVERAGE_WARNING: &str = "Candidate ranges do not cover all pages.";

/// Floor for the confidence given to a page carried forward without a name.
const CARRY_FORWARD_CONFIDENCE: f64 = 0.4;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PageDetection {
    pub(crate) page_number: i32,
    pub(crate) student_name: Option<String>,
    pub(crate) confidence: f64,
    pub(crate) evidence: Option<NameEvidence>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct BulkCandidate {
    pub(crate) candidate_id: String,
    pub(crate) student_name: String,
    pub(crate) confidence: f64,
    pub(crate) page_start: i32,
    pub(crate) page_end: i32,
    pub(crate) needs_review: bool,
    pub(crate) name_evidence: Option<NameEvidence>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct SegmentationConfig {
    pub(crate) name_match_threshold: f64,
    pub(crate) max_carry_forward_pages: usize,
    pub(crate) min_pages_per_student: usize,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            name_match_threshold: DEFAULT_NAME_MATCH_THRESHOLD,
            max_carry_forward_pages: DEFAULT_MAX_CARRY_FORWARD_PAGES,
            min_pages_per_student: 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub(crate) struct Segmentation {
    pub(crate) candidates: Vec<BulkCandidate>,
    pub(crate) warnings: Vec<String>,
}

/// Snaps `name` to the most similar roster entry when the case-insensitive
/// similarity reaches `threshold`. Similarity is `2 * matched / total` chars.
pub(crate) fn nearest_roster_name(name: &str, roster: &[String], threshold: f64) -> String {
    let needle = name.to_lowercase();
    let best = roster
        .iter()
        .map(|candidate| {
            let haystack = candidate.to_lowercase();
            let score = f64::from(TextDiff::from_chars(needle.as_str(), haystack.as_str()).ratio());
            (candidate, score)
        })
        .fold(None::<(&String, f64)>, |best, (candidate, score)| match best {
            Some((_, best_score)) if best_score >= score => best,
            _ => Some((candidate, score)),
        });

    match best {
        Some((candidate, score)) if score >= threshold => candidate.clone(),
        _ => name.to_string(),
    }
}

/// Accepts a JSON array of names or one name per line.
pub(crate) fn parse_roster(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };

    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                serde_json::Value::String(value) => value.trim().to_string(),
                other => other.to_string().trim().to_string(),
            })
            .filter(|name| !name.is_empty())
            .collect(),
        Ok(_) => Vec::new(),
        Err(_) => raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
    }
}

struct OpenCandidate {
    name: String,
    start: i32,
    confidences: Vec<f64>,
    name_evidence: Option<NameEvidence>,
}

impl OpenCandidate {
    fn new(name: String, start: i32) -> Self {
        Self { name, start, confidences: Vec::new(), name_evidence: None }
    }

    fn close(
        self,
        end: i32,
        force_review: bool,
        config: &SegmentationConfig,
        out: &mut Segmentation,
    ) {
        if end < self.start {
            return;
        }

        let mean = if self.confidences.is_empty() {
            0.0
        } else {
            self.confidences.iter().sum::<f64>() / self.confidences.len() as f64
        };
        let page_count = (end - self.start + 1) as usize;
        let short = page_count < config.min_pages_per_student;
        if self.name == UNKNOWN_STUDENT {
            out.warnings.push(format!(
                "Pages {}-{end} have no detected student name; please review.",
                self.start
            ));
        }
        if short {
            out.warnings.push(format!(
                "Candidate {} has fewer than min_pages_per_student={}",
                self.name, config.min_pages_per_student
            ));
        }

        out.candidates.push(BulkCandidate {
            candidate_id: Uuid::new_v4().simple().to_string(),
            needs_review: force_review || short || self.name == UNKNOWN_STUDENT,
            student_name: self.name,
            confidence: round3(mean),
            page_start: self.start,
            page_end: end,
            name_evidence: self.name_evidence,
        });
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Single pass over the detections in page order. Unnamed pages are carried
/// into the current candidate; more than `max_carry_forward_pages` of them in
/// a row are flagged for review.
pub(crate) fn segment_bulk_candidates(
    detections: &[PageDetection],
    roster: &[String],
    config: &SegmentationConfig,
    page_count: usize,
) -> Segmentation {
    let mut out = Segmentation::default();

    let mut ordered: Vec<&PageDetection> = detections.iter().collect();
    ordered.sort_by_key(|detection| detection.page_number);

    let (Some(first), Some(last)) = (ordered.first(), ordered.last()) else {
        if page_count > 0 {
            out.warnings.push(INCOMPLETE_COVERAGE_WARNING.to_string());
        }
        return out;
    };
    let last_page = last.page_number;

    let mut current = OpenCandidate::new(UNKNOWN_STUDENT.to_string(), first.page_number);
    let mut missing_run = 0usize;

    for detection in ordered {
        let detected = detection.student_name.as_deref().map(str::trim).filter(|name| !name.is_empty());

        let Some(detected) = detected else {
            missing_run += 1;
            if missing_run > config.max_carry_forward_pages {
                out.warnings.push(format!(
                    "Page {} has ambiguous student name; please review.",
                    detection.page_number
                ));
                current.confidences.push(0.0);
            } else {
                let previous = current.confidences.last().copied().unwrap_or(CARRY_FORWARD_CONFIDENCE);
                current.confidences.push(previous.max(CARRY_FORWARD_CONFIDENCE));
            }
            continue;
        };

        let name = nearest_roster_name(detected, roster, config.name_match_threshold);
        let evidence = detection.evidence.unwrap_or(NameEvidence {
            page_number: detection.page_number,
            x: 0.0,
            y: 0.0,
            w: 0.0,
            h: 0.0,
        });
        missing_run = 0;

        if current.name == UNKNOWN_STUDENT {
            current.name = name;
            current.confidences = vec![detection.confidence];
        } else if current.name != name {
            let next = OpenCandidate::new(name, detection.page_number);
            std::mem::replace(&mut current, next).close(
                detection.page_number - 1,
                false,
                config,
                &mut out,
            );
            current.confidences.push(detection.confidence);
        } else {
            current.confidences.push(detection.confidence);
        }
        current.name_evidence = Some(evidence);
    }

    current.close(last_page, missing_run > config.max_carry_forward_pages, config, &mut out);

    if !covers_all_pages(&out.candidates, page_count) {
        out.warnings.push(INCOMPLETE_COVERAGE_WARNING.to_string());
    }

    metrics::counter!("bulk_segment_candidates_total").increment(out.candidates.len() as u64);
    out
}

fn covers_all_pages(candidates: &[BulkCandidate], page_count: usize) -> bool {
    let covered: BTreeSet<i32> = candidates
        .iter()
        .flat_map(|candidate| candidate.page_start..=candidate.page_end)
        .collect();
    (1..=page_count as i32).all(|page| covered.contains(&page))
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub(crate) struct FinalizeCandidate {
    pub(crate) student_name: String,
    pub(crate) page_start: i32,
    pub(crate) page_end: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum FinalizeError {
    #[error("Invalid page range for {0}")]
    InvalidRange(String),
    #[error("Overlapping page range at page {0}")]
    Overlap(i32),
}

/// Checks that accepted ranges lie within `[1, page_count]` and never share
/// a page. Returns the warnings to report alongside the created submissions.
pub(crate) fn validate_finalize_candidates(
    candidates: &[FinalizeCandidate],
    page_count: usize,
) -> Result<Vec<String>, FinalizeError> {
    let max_page = page_count as i32;
    let mut used = BTreeSet::new();

    for candidate in candidates {
        if candidate.page_start < 1
            || candidate.page_end > max_page
            || candidate.page_end < candidate.page_start
        {
            return Err(FinalizeError::InvalidRange(candidate.student_name.clone()));
        }
        for page in candidate.page_start..=candidate.page_end {
            if !used.insert(page) {
                return Err(FinalizeError::Overlap(page));
            }
        }
    }

    let mut warnings = Vec::new();
    if used.len() != page_count {
        warnings.push(INCOMPLETE_COVERAGE_WARNING.to_string());
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(page_number: i32, name: &str, confidence: f64) -> PageDetection {
        PageDetection {
            page_number,
            student_name: Some(name.to_string()),
            confidence,
            evidence: None,
        }
    }

    fn blank(page_number: i32) -> PageDetection {
        PageDetection { page_number, student_name: None, confidence: 0.0, evidence: None }
    }

    fn ranges(segmentation: &Segmentation) -> Vec<(&str, i32, i32, bool)> {
        segmentation
            .candidates
            .iter()
            .map(|c| (c.student_name.as_str(), c.page_start, c.page_end, c.needs_review))
            .collect()
    }

    #[test]
    fn unnamed_page_is_carried_into_previous_student() {
        let detections =
            vec![named(1, "Alice", 0.9), named(2, "Alice", 0.85), blank(3), named(4, "Bob", 0.8)];

        let result = segment_bulk_candidates(&detections, &[], &SegmentationConfig::default(), 4);

        assert_eq!(ranges(&result), vec![("Alice", 1, 3, false), ("Bob", 4, 4, false)]);
        assert_eq!(result.candidates[0].confidence, 0.867);
        assert_eq!(result.candidates[1].confidence, 0.8);
        assert!(result.warnings.is_empty(), "unexpected warnings: {:?}", result.warnings);
    }

    #[test]
    fn leading_unnamed_pages_join_first_named_student() {
        let detections = vec![blank(1), named(2, "Alice", 0.9)];

        let result = segment_bulk_candidates(&detections, &[], &SegmentationConfig::default(), 2);

        assert_eq!(ranges(&result), vec![("Alice", 1, 2, false)]);
        assert_eq!(result.candidates[0].confidence, 0.9);
    }

    #[test]
    fn no_names_yields_single_unknown_candidate() {
        let detections = vec![blank(1), blank(2)];

        let result = segment_bulk_candidates(&detections, &[], &SegmentationConfig::default(), 2);

        assert_eq!(ranges(&result), vec![(UNKNOWN_STUDENT, 1, 2, true)]);
        assert_eq!(result.candidates[0].confidence, 0.4);
        assert_eq!(
            result.warnings,
            vec!["Pages 1-2 have no detected student name; please review.".to_string()]
        );
    }

    #[test]
    fn long_unnamed_run_is_flagged() {
        let detections =
            vec![named(1, "Alice", 0.9), blank(2), blank(3), blank(4), blank(5)];

        let result = segment_bulk_candidates(&detections, &[], &SegmentationConfig::default(), 5);

        assert_eq!(ranges(&result), vec![("Alice", 1, 5, true)]);
        assert_eq!(
            result.warnings,
            vec![
                "Page 4 has ambiguous student name; please review.".to_string(),
                "Page 5 has ambiguous student name; please review.".to_string(),
            ]
        );
        // 0.9, 0.9, 0.9, 0.0, 0.0
        assert_eq!(result.candidates[0].confidence, 0.54);
    }

    #[test]
    fn roster_snaps_misspelled_names() {
        let roster = vec!["Alice Johnson".to_string(), "Bob Smith".to_string()];
        assert_eq!(nearest_roster_name("alice jonson", &roster, 0.65), "Alice Johnson");
        assert_eq!(nearest_roster_name("Zed", &roster, 0.65), "Zed");
        assert_eq!(nearest_roster_name("Zed", &[], 0.65), "Zed");

        let detections = vec![named(1, "Alice Jonson", 0.9), named(2, "ALICE JOHNSON", 0.8)];
        let result =
            segment_bulk_candidates(&detections, &roster, &SegmentationConfig::default(), 2);
        assert_eq!(ranges(&result), vec![("Alice Johnson", 1, 2, false)]);
    }

    #[test]
    fn roster_snaps_abbreviated_names() {
        let roster = vec!["Alice Johnson".to_string()];
        // 7 shared chars over 20 total: 0.7
        assert_eq!(nearest_roster_name("Alice J", &roster, 0.65), "Alice Johnson");
        // 3 shared chars over 14 total: 0.43
        let roster = vec!["Bobby Smith".to_string()];
        assert_eq!(nearest_roster_name("Bob", &roster, 0.65), "Bob");
        assert_eq!(nearest_roster_name("Bob", &roster, 0.4), "Bobby Smith");
    }

    #[test]
    fn short_candidates_need_review() {
        let config = SegmentationConfig { min_pages_per_student: 2, ..SegmentationConfig::default() };
        let detections = vec![named(1, "Alice", 0.9), named(2, "Alice", 0.9), named(3, "Bob", 0.9)];

        let result = segment_bulk_candidates(&detections, &[], &config, 3);

        assert_eq!(ranges(&result), vec![("Alice", 1, 2, false), ("Bob", 3, 3, true)]);
        assert_eq!(result.warnings, vec!["Candidate Bob has fewer than min_pages_per_student=2"]);
    }

    #[test]
    fn candidate_keeps_its_own_name_evidence() {
        let mut alice = named(1, "Alice", 0.9);
        alice.evidence = Some(NameEvidence { page_number: 1, x: 0.1, y: 0.1, w: 0.3, h: 0.05 });
        let detections = vec![alice, named(2, "Bob", 0.9)];

        let result = segment_bulk_candidates(&detections, &[], &SegmentationConfig::default(), 2);

        assert_eq!(result.candidates[0].name_evidence.map(|e| e.x), Some(0.1));
        assert_eq!(result.candidates[1].name_evidence.map(|e| e.page_number), Some(2));
    }

    #[test]
    fn candidate_ranges_never_overlap() {
        let patterns: [&[Option<&str>]; 4] = [
            &[Some("A"), None, Some("B"), None, None, None, Some("A")],
            &[None, None, None],
            &[Some("A"), Some("B"), Some("A"), Some("B")],
            &[None, Some("C"), None, None, Some("C"), Some("D")],
        ];

        for pattern in patterns {
            let detections: Vec<PageDetection> = pattern
                .iter()
                .enumerate()
                .map(|(idx, name)| match name {
                    Some(name) => named(idx as i32 + 1, name, 0.7),
                    None => blank(idx as i32 + 1),
                })
                .collect();

            let result = segment_bulk_candidates(
                &detections,
                &[],
                &SegmentationConfig::default(),
                pattern.len(),
            );

            let mut seen = BTreeSet::new();
            for candidate in &result.candidates {
                assert!(candidate.page_start <= candidate.page_end);
                for page in candidate.page_start..=candidate.page_end {
                    assert!(seen.insert(page), "page {page} assigned twice in {pattern:?}");
                }
            }
            assert_eq!(seen.len(), pattern.len());
            assert!(!result.warnings.iter().any(|w| w == INCOMPLETE_COVERAGE_WARNING));
        }
    }

    #[test]
    fn missing_pages_produce_coverage_warning() {
        let detections = vec![named(2, "Alice", 0.9), named(3, "Alice", 0.9)];
        let result = segment_bulk_candidates(&detections, &[], &SegmentationConfig::default(), 3);
        assert!(result.warnings.iter().any(|w| w == INCOMPLETE_COVERAGE_WARNING));

        let empty = segment_bulk_candidates(&[], &[], &SegmentationConfig::default(), 2);
        assert!(empty.candidates.is_empty());
        assert_eq!(empty.warnings, vec![INCOMPLETE_COVERAGE_WARNING.to_string()]);
    }

    #[test]
    fn roster_accepts_json_or_lines() {
        assert_eq!(parse_roster(Some(r#"["Alice", " ", "Bob "]"#)), vec!["Alice", "Bob"]);
        assert_eq!(parse_roster(Some("Alice\n\n  Bob\n")), vec!["Alice", "Bob"]);
        assert!(parse_roster(Some("{\"a\": 1}")).is_empty());
        assert!(parse_roster(None).is_empty());
    }

    #[test]
    fn finalize_rejects_bad_and_overlapping_ranges() {
        let candidate = |name: &str, page_start, page_end| FinalizeCandidate {
            student_name: name.to_string(),
            page_start,
            page_end,
        };

        assert_eq!(
            validate_finalize_candidates(&[candidate("Alice", 0, 2)], 4),
            Err(FinalizeError::InvalidRange("Alice".to_string()))
        );
        assert_eq!(
            validate_finalize_candidates(&[candidate("Alice", 3, 2)], 4),
            Err(FinalizeError::InvalidRange("Alice".to_string()))
        );
        assert_eq!(
            validate_finalize_candidates(&[candidate("Alice", 1, 5)], 4),
            Err(FinalizeError::InvalidRange("Alice".to_string()))
        );
        assert_eq!(
            validate_finalize_candidates(&[candidate("Alice", 1, 2), candidate("Bob", 2, 4)], 4),
            Err(FinalizeError::Overlap(2))
        );

        let full = validate_finalize_candidates(
            &[candidate("Alice", 1, 2), candidate("Bob", 3, 4)],
            4,
        );
        assert_eq!(full, Ok(Vec::new()));

        let partial = validate_finalize_candidates(&[candidate("Alice", 1, 2)], 4);
        assert_eq!(partial, Ok(vec![INCOMPLETE_COVERAGE_WARNING.to_string()]));
    }
}
