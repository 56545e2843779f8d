//! The queries the driver knows how to issue, in polling order.

use crate::response::Field;
use std::fmt;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueryId {
    /// `MOD`, the working mode of the inverter.
    Mode,
    /// `GS`, the general status block with the electrical measurements.
    GeneralStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseShape {
    Measurements,
    DeviceMode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Query {
    pub id: QueryId,
    pub command: &'static str,
    pub shape: ResponseShape,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CatalogError {
    #[error("query {0} is not in the catalog")]
    UnknownQuery(QueryId),
}

static CATALOG: [Query; 2] = [
    Query {
        id: QueryId::Mode,
        command: "MOD",
        shape: ResponseShape::DeviceMode,
    },
    Query {
        id: QueryId::GeneralStatus,
        command: "GS",
        shape: ResponseShape::Measurements,
    },
];

/// All queries in round-robin order.
pub fn all() -> &'static [Query] {
    &CATALOG
}

pub fn lookup(id: QueryId) -> Result<&'static Query, CatalogError> {
    CATALOG
        .iter()
        .find(|query| query.id == id)
        .ok_or(CatalogError::UnknownQuery(id))
}

impl Query {
    /// Fields a successful answer to this query can publish.
    pub fn fields(&self) -> &'static [Field] {
        match self.shape {
            ResponseShape::Measurements => Field::MEASUREMENTS,
            ResponseShape::DeviceMode => &[Field::Mode],
        }
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let command = match self {
            QueryId::Mode => "MOD",
            QueryId::GeneralStatus => "GS",
        };
        f.write_str(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polling_order_is_stable() {
        let ids: Vec<QueryId> = all().iter().map(|query| query.id).collect();
        assert_eq!(ids, [QueryId::Mode, QueryId::GeneralStatus]);
    }

    #[test]
    fn every_catalog_entry_can_be_looked_up() {
        for query in all() {
            assert_eq!(lookup(query.id).unwrap(), query);
            assert_eq!(query.id.to_string(), query.command);
        }
    }

    #[test]
    fn one_query_per_shape() {
        let shapes: Vec<ResponseShape> = all().iter().map(|query| query.shape).collect();
        assert!(shapes.contains(&ResponseShape::Measurements));
        assert!(shapes.contains(&ResponseShape::DeviceMode));
    }

    #[test]
    fn fields_follow_the_shape() {
        let mode = lookup(QueryId::Mode).unwrap();
        assert_eq!(mode.fields(), &[Field::Mode]);

        let status = lookup(QueryId::GeneralStatus).unwrap();
        assert!(status.fields().contains(&Field::GridVoltage));
        assert!(!status.fields().contains(&Field::Mode));
    }
}
