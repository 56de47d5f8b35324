use std::fmt::Display;

/// Query-string parameters, kept in insertion order.
///
/// Absent values are dropped when the parameter is added, so a `Query` never
/// serializes `key=` for a missing filter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Query {
    pairs: Vec<(String, String)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter.
    pub fn pair(mut self, key: impl Into<String>, value: impl Display) -> Self {
        self.pairs.push((key.into(), value.to_string()));
        self
    }

    /// Adds a parameter only when `value` is present.
    pub fn maybe<V: Display>(self, key: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(value) => self.pair(key, value),
            None => self,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// Percent-encoded `key=value&key=value` form, without a leading `?`.
    pub fn encode(&self) -> String {
        self.pairs
            .iter()
            .map(|(key, value)| {
                format!("{}={}", urlencoding::encode(key), urlencoding::encode(value))
            })
            .collect::<Vec<_>>()
            .join("&")
    }
}

impl From<()> for Query {
    fn from(_: ()) -> Self {
        Self::default()
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for Query
where
    K: Into<String>,
    V: Display,
{
    fn from(pairs: [(K, V); N]) -> Self {
        pairs
            .into_iter()
            .fold(Self::new(), |query, (key, value)| query.pair(key, value))
    }
}

impl<K, V> From<Vec<(K, Option<V>)>> for Query
where
    K: Into<String>,
    V: Display,
{
    fn from(pairs: Vec<(K, Option<V>)>) -> Self {
        pairs
            .into_iter()
            .fold(Self::new(), |query, (key, value)| query.maybe(key, value))
    }
}

impl<K, V> FromIterator<(K, V)> for Query
where
    K: Into<String>,
    V: Display,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(), |query, (key, value)| query.pair(key, value))
    }
}

#[cfg(test)]
mod tests {
    use super::Query;

    #[test]
    fn encodes_in_insertion_order() {
        let query = Query::from([("status", "active"), ("page", "2")]);
        assert_eq!(query.encode(), "status=active&page=2");
    }

    #[test]
    fn drops_absent_values() {
        let query = Query::from(vec![
            ("search", None),
            ("locationId", Some("loc-1")),
            ("dateFrom", None),
        ]);
        assert_eq!(query.encode(), "locationId=loc-1");

        let query = Query::new().pair("page", 1).maybe("limit", None::<u32>);
        assert_eq!(query.encode(), "page=1");
    }

    #[test]
    fn percent_encodes_keys_and_values() {
        let query = Query::new()
            .pair("search", "Nguyễn Văn A")
            .pair("status", "on_time,late");
        assert_eq!(
            query.encode(),
            "search=Nguy%E1%BB%85n%20V%C4%83n%20A&status=on_time%2Clate"
        );
    }

    #[test]
    fn unit_is_empty() {
        assert!(Query::from(()).is_empty());
        assert_eq!(Query::from(()).encode(), "");
    }
}
