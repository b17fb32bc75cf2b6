use crate::error::PredictError;
use crate::loader::Snapshot;
use crate::models::{Cell, CollegeCutoff, PredictQuery, PredictResponse, RawQuery, Row, Table, BRANCH, COLLEGE_CODE, COLLEGE_NAME};
use anyhow::{Context, Result};
use log::{debug, info};
use serde_json::Value;
use std::sync::Arc;

/// Marks a category/branch combination that a college does not offer.
pub const PLACEHOLDER: &str = "--";

/// Branch filter value that disables branch filtering.
pub const ALL_BRANCHES: &str = "all";

impl PredictQuery {
    /// Validate the caller's rank and collect the remaining parameters.
    /// An absent, null or blank rank means rank 0.
    pub fn from_raw(raw: RawQuery) -> Result<Self, PredictError> {
        let rank = parse_rank(raw.rank.as_ref())?;
        Ok(Self {
            rank,
            category: raw.category.unwrap_or_default(),
            branch: raw.branch,
        })
    }
}

pub fn parse_rank(raw: Option<&Value>) -> Result<i64, PredictError> {
    match raw {
        None | Some(Value::Null) => Ok(0),
        Some(Value::String(s)) => parse_rank_str(s),
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).and_then(truncate_to_i64))
            .ok_or_else(|| PredictError::BadRequest(n.to_string())),
        Some(other) => Err(PredictError::BadRequest(other.to_string())),
    }
}

pub fn parse_rank_str(raw: &str) -> Result<i64, PredictError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed
        .parse::<i64>()
        .map_err(|_| PredictError::BadRequest(raw.to_string()))
}

fn truncate_to_i64(value: f64) -> Option<i64> {
    let truncated = value.trunc();
    // i64::MAX as f64 rounds up to 2^63, so the upper bound is exclusive
    if truncated >= i64::MIN as f64 && truncated < i64::MAX as f64 {
        Some(truncated as i64)
    } else {
        None
    }
}

/// Parse a cutoff cell. `None` means the row does not qualify for this
/// category: the cell is missing, the placeholder, or not a usable number.
pub fn parse_cutoff(cell: &Cell) -> Option<i64> {
    let raw = cell.as_text()?;
    if raw == PLACEHOLDER {
        return None;
    }

    let cleaned = raw.replace(PLACEHOLDER, "");
    let value = cleaned.trim().parse::<f64>().ok().filter(|v| v.is_finite())?;
    truncate_to_i64(value).filter(|cutoff| *cutoff >= 0)
}

/// Lower-cased branch needle, or `None` when every branch should pass.
fn branch_needle(filter: Option<&str>) -> Option<String> {
    filter
        .filter(|f| !f.is_empty() && !f.eq_ignore_ascii_case(ALL_BRANCHES))
        .map(str::to_lowercase)
}

/// Connectives skipped when abbreviating a branch name.
const ACRONYM_STOPWORDS: &[&str] = &["and", "of", "in", "the", "for", "with"];

/// Lower-case initials of a branch name, so "Computer Science and Engineering"
/// abbreviates to "cse".
pub fn branch_acronym(branch: &str) -> String {
    branch
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .filter(|word| !ACRONYM_STOPWORDS.iter().any(|stop| word.eq_ignore_ascii_case(stop)))
        .filter_map(|word| word.chars().next())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Rows without a branch never match a filter. Otherwise the needle may appear
/// in the branch name itself or in its acronym.
fn branch_matches(row: &Row<'_>, needle: Option<&str>) -> bool {
    let Some(needle) = needle else {
        return true;
    };
    match row.text(BRANCH) {
        Some(branch) => branch.to_lowercase().contains(needle) || branch_acronym(branch).contains(needle),
        None => false,
    }
}

/// Find every college whose cutoff for the query's category is at or above
/// the student's rank, ordered by cutoff (ties keep dataset order).
pub fn predict(table: &Table, query: &PredictQuery) -> Result<Vec<CollegeCutoff>, PredictError> {
    if table.is_empty() {
        return Err(PredictError::DataUnavailable);
    }
    if query.category.is_empty() || !table.is_category(&query.category) {
        return Err(PredictError::UnknownCategory(query.category.clone()));
    }

    let needle = branch_needle(query.branch.as_deref());

    let mut colleges: Vec<CollegeCutoff> = table
        .rows()
        .enumerate()
        .filter(|(_, row)| branch_matches(row, needle.as_deref()))
        .filter_map(|(i, row)| {
            let cell = row.get(&query.category);
            let Some(cutoff) = parse_cutoff(cell) else {
                debug!("Skipping row {}: no usable {} cutoff in {:?}", i, query.category, cell);
                return None;
            };
            (cutoff >= query.rank).then(|| CollegeCutoff {
                code: row.text(COLLEGE_CODE).unwrap_or_default().to_string(),
                name: row.text(COLLEGE_NAME).unwrap_or_default().to_string(),
                branch: row.text(BRANCH).unwrap_or_default().to_string(),
                cutoff,
            })
        })
        .collect();

    // stable: equal cutoffs keep dataset order
    colleges.sort_by_key(|college| college.cutoff);

    Ok(colleges)
}

/// Validate and run a raw query against `table`.
pub fn answer(table: &Table, raw: RawQuery) -> Result<Vec<CollegeCutoff>, PredictError> {
    let query = PredictQuery::from_raw(raw)?;
    debug!(
        "Processing request: rank={}, category={}, branch={:?}",
        query.rank, query.category, query.branch
    );

    match predict(table, &query) {
        Ok(colleges) => {
            info!("Found {} matching colleges", colleges.len());
            Ok(colleges)
        }
        Err(e) => {
            info!("Rejected query ({}): {}", e.status(), e);
            Err(e)
        }
    }
}

impl From<Result<Vec<CollegeCutoff>, PredictError>> for PredictResponse {
    fn from(result: Result<Vec<CollegeCutoff>, PredictError>) -> Self {
        match result {
            Ok(colleges) => PredictResponse::Colleges { colleges },
            Err(e) => PredictResponse::Error { error: e.to_string() },
        }
    }
}

/// Run a raw query end to end, folding failures into the response payload.
pub fn respond(table: &Table, raw: RawQuery) -> PredictResponse {
    answer(table, raw).into()
}

/// Answer many queries concurrently against one snapshot.
/// Responses come back in input order.
pub async fn run_batch(snapshot: Arc<Snapshot>, queries: Vec<RawQuery>) -> Result<Vec<PredictResponse>> {
    let handles: Vec<_> = queries
        .into_iter()
        .map(|raw| {
            let snapshot = Arc::clone(&snapshot);
            tokio::task::spawn_blocking(move || respond(&snapshot.table, raw))
        })
        .collect();

    let mut responses = Vec::with_capacity(handles.len());
    for (i, handle) in handles.into_iter().enumerate() {
        responses.push(handle.await.with_context(|| format!("Query {} did not complete", i))?);
    }
    Ok(responses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text(s: &str) -> Cell {
        Cell::Text(s.to_string())
    }

    fn table(rows: Vec<Vec<Cell>>) -> Table {
        Table::new(
            ["College Code", "College Name", "Branch", "GM", "SC", "ST"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            rows,
        )
    }

    fn two_college_table() -> Table {
        table(vec![
            vec![text("E001"), text("X College, Bangalore"), text("CSE"), text("5000")],
            vec![text("E002"), text("Y College, Mysore"), text("ECE"), text("--")],
        ])
    }

    fn query(rank: i64, category: &str, branch: &str) -> PredictQuery {
        PredictQuery {
            rank,
            category: category.to_string(),
            branch: Some(branch.to_string()),
        }
    }

    fn cutoffs(result: &[CollegeCutoff]) -> Vec<i64> {
        result.iter().map(|c| c.cutoff).collect()
    }

    #[test]
    fn test_placeholder_cutoff_is_excluded() {
        let result = predict(&two_college_table(), &query(4000, "GM", "all")).unwrap();
        assert_eq!(
            result,
            vec![CollegeCutoff {
                code: "E001".to_string(),
                name: "X College, Bangalore".to_string(),
                branch: "CSE".to_string(),
                cutoff: 5000,
            }]
        );
    }

    #[test]
    fn test_rank_above_cutoff_is_not_eligible() {
        let result = predict(&two_college_table(), &query(6000, "GM", "all")).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_branch_without_valid_cutoff_yields_empty() {
        let result = predict(&two_college_table(), &query(0, "GM", "ece")).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_equal_cutoff_qualifies() {
        let result = predict(&two_college_table(), &query(5000, "GM", "")).unwrap();
        assert_eq!(cutoffs(&result), vec![5000]);
    }

    #[test]
    fn test_results_sorted_ascending_and_stable() {
        let t = table(vec![
            vec![text("A"), text("A College"), text("CSE"), text("900")],
            vec![text("B"), text("B College"), text("CSE"), text("300")],
            vec![text("C"), text("C College"), text("CSE"), text("900")],
            vec![text("D"), text("D College"), text("CSE"), text("100")],
            vec![text("E"), text("E College"), text("CSE"), text("300.9")],
        ]);
        let result = predict(&t, &query(200, "GM", "all")).unwrap();

        assert_eq!(cutoffs(&result), vec![300, 300, 900, 900]);
        let codes: Vec<&str> = result.iter().map(|c| c.code.as_str()).collect();
        assert_eq!(codes, vec!["B", "E", "A", "C"]);
        assert!(result.iter().all(|c| c.cutoff >= 200));
    }

    #[test]
    fn test_branch_filter_is_case_insensitive_substring() {
        let t = table(vec![
            vec![text("E001"), text("X"), text("Computer Science and Engineering"), text("10")],
            vec![text("E002"), text("Y"), text("CSE Data Science"), text("20")],
            vec![text("E003"), text("Z"), Cell::Missing, text("30")],
            vec![text("E004"), text("W"), text("Civil"), text("40")],
        ]);

        let result = predict(&t, &query(0, "GM", "cse")).unwrap();
        assert_eq!(cutoffs(&result), vec![10, 20]);

        let result = predict(&t, &query(0, "GM", "CIV")).unwrap();
        assert_eq!(cutoffs(&result), vec![40]);

        let result = predict(&t, &query(0, "GM", "SCIENCE")).unwrap();
        assert_eq!(cutoffs(&result), vec![10, 20]);

        let result = predict(&t, &query(0, "GM", "ALL")).unwrap();
        assert_eq!(cutoffs(&result), vec![10, 20, 30, 40]);

        let mut unfiltered = query(0, "GM", "");
        unfiltered.branch = None;
        assert_eq!(predict(&t, &unfiltered).unwrap().len(), 4);
    }

    #[test]
    fn test_branch_acronym() {
        assert_eq!(branch_acronym("Computer Science and Engineering"), "cse");
        assert_eq!(branch_acronym("Electronics & Communication Engg."), "ece");
        assert_eq!(branch_acronym("Artificial Intelligence and Machine Learning"), "aiml");
        assert_eq!(branch_acronym("  "), "");
    }

    #[test]
    fn test_acronym_matching_widens_branch_filter() {
        let t = table(vec![
            vec![text("E001"), text("X"), text("Automobile Engineering"), text("10")],
            vec![text("E002"), text("Y"), text("Aeronautical Engineering"), text("20")],
            vec![text("E003"), text("Z"), text("Civil Engineering"), text("30")],
        ]);

        // "ae" is the acronym of Automobile Engineering and a substring of Aeronautical
        let result = predict(&t, &query(0, "GM", "ae")).unwrap();
        assert_eq!(cutoffs(&result), vec![10, 20]);

        // single letters match nearly everything through the name or the acronym
        let result = predict(&t, &query(0, "GM", "e")).unwrap();
        assert_eq!(cutoffs(&result), vec![10, 20, 30]);

        // neither a name nor an acronym contains "xe"
        let result = predict(&t, &query(0, "GM", "xe")).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_unknown_category_is_error_not_empty() {
        let err = predict(&two_college_table(), &query(0, "ZZZ", "all")).unwrap_err();
        assert_eq!(err, PredictError::UnknownCategory("ZZZ".to_string()));

        let err = predict(&two_college_table(), &query(0, "gm", "all")).unwrap_err();
        assert_eq!(err, PredictError::UnknownCategory("gm".to_string()));

        let err = predict(&two_college_table(), &query(0, "", "all")).unwrap_err();
        assert_eq!(err, PredictError::UnknownCategory(String::new()));
    }

    #[test]
    fn test_empty_table_is_data_unavailable() {
        let err = predict(&Table::empty(), &query(0, "GM", "all")).unwrap_err();
        assert_eq!(err, PredictError::DataUnavailable);

        // even a header-only table has nothing to offer
        let err = predict(&table(Vec::new()), &query(0, "ZZZ", "all")).unwrap_err();
        assert_eq!(err, PredictError::DataUnavailable);
    }

    #[test]
    fn test_parse_cutoff_handles_messy_values() {
        assert_eq!(parse_cutoff(&text("5000")), Some(5000));
        assert_eq!(parse_cutoff(&text(" 5000.7 ")), Some(5000));
        assert_eq!(parse_cutoff(&text("--1200")), Some(1200));
        assert_eq!(parse_cutoff(&text("12--00")), Some(1200));
        assert_eq!(parse_cutoff(&text("1e3")), Some(1000));
        assert_eq!(parse_cutoff(&Cell::Missing), None);
        assert_eq!(parse_cutoff(&text("--")), None);
        assert_eq!(parse_cutoff(&text("----")), None);
        assert_eq!(parse_cutoff(&text("abc")), None);
        assert_eq!(parse_cutoff(&text("inf")), None);
        assert_eq!(parse_cutoff(&text("NaN")), None);
        assert_eq!(parse_cutoff(&text("-5")), None);
        assert_eq!(parse_cutoff(&text("1e300")), None);
    }

    #[test]
    fn test_malformed_rows_are_skipped_not_fatal() {
        let t = table(vec![
            vec![text("E001"), text("X"), text("CSE"), text("garbage")],
            vec![text("E002"), text("Y"), text("CSE"), text("700")],
            vec![text("E003"), text("Z"), text("CSE")],
        ]);
        let result = predict(&t, &query(0, "GM", "all")).unwrap();
        assert_eq!(cutoffs(&result), vec![700]);
    }

    #[test]
    fn test_predict_is_idempotent() {
        let t = two_college_table();
        let q = query(0, "GM", "all");
        assert_eq!(predict(&t, &q).unwrap(), predict(&t, &q).unwrap());
    }

    #[test]
    fn test_parse_rank_inputs() {
        assert_eq!(parse_rank(None), Ok(0));
        assert_eq!(parse_rank(Some(&Value::Null)), Ok(0));
        assert_eq!(parse_rank(Some(&json!(""))), Ok(0));
        assert_eq!(parse_rank(Some(&json!(" 4200 "))), Ok(4200));
        assert_eq!(parse_rank(Some(&json!(4200))), Ok(4200));
        assert_eq!(parse_rank(Some(&json!(4200.9))), Ok(4200));
        assert_eq!(parse_rank(Some(&json!("12.5"))), Err(PredictError::BadRequest("12.5".to_string())));
        assert_eq!(parse_rank(Some(&json!("abc"))), Err(PredictError::BadRequest("abc".to_string())));
        assert!(parse_rank(Some(&json!(true))).is_err());
    }

    #[test]
    fn test_answer_keeps_error_kind() {
        let raw = RawQuery {
            rank: Some(json!(10)),
            category: Some("ZZZ".to_string()),
            branch: None,
        };
        let err = answer(&two_college_table(), raw).unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::NotFound);
    }

    #[test]
    fn test_respond_validates_rank_before_dataset() {
        let raw = RawQuery {
            rank: Some(json!("abc")),
            category: Some("GM".to_string()),
            branch: None,
        };
        let response = respond(&Table::empty(), raw);
        assert_eq!(
            response,
            PredictResponse::Error {
                error: "Invalid rank 'abc': expected an integer".to_string()
            }
        );
    }

    #[test]
    fn test_respond_defaults_missing_rank_to_zero() {
        let raw: RawQuery = serde_json::from_value(json!({"category": "GM", "branch": "all"})).unwrap();
        match respond(&two_college_table(), raw) {
            PredictResponse::Colleges { colleges } => assert_eq!(cutoffs(&colleges), vec![5000]),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_batch_preserves_input_order() {
        let t = Arc::new(Snapshot {
            version: 1,
            table: two_college_table(),
        });
        let queries: Vec<RawQuery> = serde_json::from_value(json!([
            {"rank": 4000, "category": "GM", "branch": "all"},
            {"rank": "x", "category": "GM"},
            {"rank": 0, "category": "ZZZ"},
            {"rank": 6000, "category": "GM"},
        ]))
        .unwrap();

        let responses = run_batch(t, queries).await.unwrap();
        assert_eq!(responses.len(), 4);
        assert!(matches!(&responses[0], PredictResponse::Colleges { colleges } if colleges.len() == 1));
        assert!(matches!(&responses[1], PredictResponse::Error { error } if error.contains("'x'")));
        assert!(matches!(&responses[2], PredictResponse::Error { error } if error.contains("ZZZ")));
        assert_eq!(responses[3], PredictResponse::Colleges { colleges: Vec::new() });
    }
}
