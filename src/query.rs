use std::collections::HashMap;

use lazy_static::lazy_static;
use mongodb::bson::{doc, Bson, Document};
use regex::Regex;

use crate::error::AppError;

lazy_static! {
    // `duration[gte]=5` style comparison keys.
    static ref COMPARISON_KEY: Regex = Regex::new(r"^([A-Za-z0-9_.]+)\[([a-z]+)\]$").unwrap();
}

/// Parameters that shape the query rather than filter it.
const RESERVED_PARAMS: [&str; 4] = ["page", "sort", "limit", "fields"];

/// Translates raw query-string parameters into the filter, sort, projection
/// and pagination pieces of a collection read. The operations chain
/// left-to-right and the caller runs the accumulated query exactly once.
#[derive(Debug)]
pub struct ApiFeatures {
    params: HashMap<String, String>,
    pub filter: Document,
    pub sort: Document,
    pub projection: Option<Document>,
    pub skip: u64,
    pub limit: i64,
}

impl ApiFeatures {
    pub fn new(params: HashMap<String, String>) -> Self {
        ApiFeatures {
            params,
            filter: Document::new(),
            sort: Document::new(),
            projection: None,
            skip: 0,
            limit: 100,
        }
    }

    /// Non-reserved parameters become exact-match conditions; keys shaped
    /// `field[gte|gt|lte|lt]` become the native `$`-prefixed comparison
    /// operators. An unrecognized operator is the caller's error.
    pub fn filter(mut self) -> Result<Self, AppError> {
        for (key, value) in &self.params {
            if RESERVED_PARAMS.contains(&key.as_str()) {
                continue;
            }

            if let Some(caps) = COMPARISON_KEY.captures(key) {
                let field = caps[1].to_string();
                let operator = match &caps[2] {
                    "gte" => "$gte",
                    "gt" => "$gt",
                    "lte" => "$lte",
                    "lt" => "$lt",
                    other => {
                        return Err(AppError::new(
                            format!("Unsupported query operator: {}", other),
                            400,
                        ))
                    }
                };
                let mut conditions = match self.filter.remove(&field) {
                    Some(Bson::Document(existing)) => existing,
                    _ => Document::new(),
                };
                conditions.insert(operator, coerce(value));
                self.filter.insert(field, conditions);
            } else {
                self.filter.insert(key.clone(), coerce(value));
            }
        }
        Ok(self)
    }

    /// Comma-separated field list, leading `-` for descending. Defaults to
    /// newest-first.
    pub fn sort(mut self) -> Self {
        match self.params.get("sort") {
            Some(sort_by) => {
                for field in sort_by.split(',') {
                    let field = field.trim();
                    if field.is_empty() {
                        continue;
                    }
                    match field.strip_prefix('-') {
                        Some(name) => self.sort.insert(name, -1),
                        None => self.sort.insert(field, 1),
                    };
                }
            }
            None => {
                self.sort.insert("createdAt", -1);
            }
        }
        self
    }

    /// Comma-separated projection list. Without one, everything except the
    /// internal `createdAt` bookkeeping field is returned.
    pub fn limit_fields(mut self) -> Self {
        match self.params.get("fields") {
            Some(fields) => {
                let mut projection = Document::new();
                for field in fields.split(',') {
                    let field = field.trim();
                    if field.is_empty() {
                        continue;
                    }
                    match field.strip_prefix('-') {
                        Some(name) => projection.insert(name, 0),
                        None => projection.insert(field, 1),
                    };
                }
                self.projection = Some(projection);
            }
            None => {
                self.projection = Some(doc! { "createdAt": 0 });
            }
        }
        self
    }

    /// `page` defaults to 1, `limit` to 100. A page past the end of the
    /// result set comes back empty rather than as an error.
    pub fn paginate(mut self) -> Self {
        let page = self
            .params
            .get("page")
            .and_then(|p| p.parse::<u64>().ok())
            .filter(|p| *p > 0)
            .unwrap_or(1);
        let limit = self
            .params
            .get("limit")
            .and_then(|l| l.parse::<i64>().ok())
            .filter(|l| *l > 0)
            .unwrap_or(100);

        self.skip = (page - 1) * limit as u64;
        self.limit = limit;
        self
    }
}

/// Query-string values are untyped; comparisons only behave when numbers
/// arrive as numbers.
fn coerce(raw: &str) -> Bson {
    if let Ok(n) = raw.parse::<i64>() {
        return Bson::Int64(n);
    }
    if let Ok(n) = raw.parse::<f64>() {
        return Bson::Double(n);
    }
    if let Ok(b) = raw.parse::<bool>() {
        return Bson::Boolean(b);
    }
    Bson::String(raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn comparison_keys_become_native_operators() {
        let features = ApiFeatures::new(params(&[("duration[gte]", "5")]))
            .filter()
            .unwrap();
        assert_eq!(
            features.filter,
            doc! { "duration": { "$gte": 5_i64 } }
        );
    }

    #[test]
    fn comparison_keys_merge_per_field() {
        let features = ApiFeatures::new(params(&[
            ("price[gte]", "500"),
            ("price[lt]", "1500"),
        ]))
        .filter()
        .unwrap();
        let conditions = features.filter.get_document("price").unwrap();
        assert_eq!(conditions.get_i64("$gte").unwrap(), 500);
        assert_eq!(conditions.get_i64("$lt").unwrap(), 1500);
    }

    #[test]
    fn plain_keys_are_exact_matches() {
        let features = ApiFeatures::new(params(&[("difficulty", "easy")]))
            .filter()
            .unwrap();
        assert_eq!(features.filter, doc! { "difficulty": "easy" });
    }

    #[test]
    fn reserved_keys_are_dropped_from_the_filter() {
        let features = ApiFeatures::new(params(&[
            ("page", "2"),
            ("sort", "price"),
            ("limit", "10"),
            ("fields", "name"),
            ("difficulty", "medium"),
        ]))
        .filter()
        .unwrap();
        assert_eq!(features.filter, doc! { "difficulty": "medium" });
    }

    #[test]
    fn unknown_operator_is_a_client_error() {
        let err = ApiFeatures::new(params(&[("duration[near]", "5")]))
            .filter()
            .unwrap_err();
        assert_eq!(err.status_code, 400);
        assert_eq!(err.status, "fail");
    }

    #[test]
    fn sort_defaults_to_newest_first() {
        let features = ApiFeatures::new(params(&[])).sort();
        assert_eq!(features.sort, doc! { "createdAt": -1 });
    }

    #[test]
    fn sort_splits_comma_separated_fields() {
        let features = ApiFeatures::new(params(&[("sort", "-ratingsAverage,price")])).sort();
        assert_eq!(features.sort, doc! { "ratingsAverage": -1, "price": 1 });
    }

    #[test]
    fn fields_become_an_include_projection() {
        let features =
            ApiFeatures::new(params(&[("fields", "name,price,ratingsAverage")])).limit_fields();
        assert_eq!(
            features.projection,
            Some(doc! { "name": 1, "price": 1, "ratingsAverage": 1 })
        );
    }

    #[test]
    fn default_projection_hides_created_at() {
        let features = ApiFeatures::new(params(&[])).limit_fields();
        assert_eq!(features.projection, Some(doc! { "createdAt": 0 }));
    }

    #[test]
    fn pagination_computes_the_skip_offset() {
        let features = ApiFeatures::new(params(&[("page", "2"), ("limit", "10")])).paginate();
        assert_eq!(features.skip, 10);
        assert_eq!(features.limit, 10);
    }

    #[test]
    fn pagination_defaults() {
        let features = ApiFeatures::new(params(&[])).paginate();
        assert_eq!(features.skip, 0);
        assert_eq!(features.limit, 100);
    }

    #[test]
    fn unparsable_pagination_falls_back_to_defaults() {
        let features = ApiFeatures::new(params(&[("page", "first"), ("limit", "-3")])).paginate();
        assert_eq!(features.skip, 0);
        assert_eq!(features.limit, 100);
    }

    #[test]
    fn values_are_coerced_by_shape() {
        assert_eq!(coerce("5"), Bson::Int64(5));
        assert_eq!(coerce("4.5"), Bson::Double(4.5));
        assert_eq!(coerce("true"), Bson::Boolean(true));
        assert_eq!(coerce("easy"), Bson::String("easy".to_string()));
    }
}
