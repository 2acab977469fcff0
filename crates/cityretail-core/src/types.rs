use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// The four warehouse entities, in referential-integrity load order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    DimDate,
    DimProduct,
    DimStore,
    FactSales,
}

impl Entity {
    /// Dimensions before facts; facts reference all three dimensions.
    pub const LOAD_ORDER: [Entity; 4] = [
        Entity::DimDate,
        Entity::DimProduct,
        Entity::DimStore,
        Entity::FactSales,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            Entity::DimDate => "dimdate",
            Entity::DimProduct => "dimproduct",
            Entity::DimStore => "dimstore",
            Entity::FactSales => "factsales",
        }
    }

    pub fn key_column(&self) -> &'static str {
        match self {
            Entity::DimDate => "dateid",
            Entity::DimProduct => "productid",
            Entity::DimStore => "storeid",
            Entity::FactSales => "salesid",
        }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Entity::DimDate => "DimDate",
            Entity::DimProduct => "DimProduct",
            Entity::DimStore => "DimStore",
            Entity::FactSales => "FactSales",
        };
        f.write_str(name)
    }
}

/// One calendar day. Every attribute is a pure function of `fulldate`, so rows
/// are immutable once created; `dateid` is the date as YYYYMMDD.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct DateRecord {
    pub dateid: i32,
    pub fulldate: NaiveDate,
    pub year: i32,
    pub quarter: i16,
    pub month: i16,
    pub day: i16,
    pub weekdayname: String,
    pub weeknumber: i16,
    pub isweekend: bool,
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct ProductRecord {
    pub productid: i32,
    pub productname: String,
    pub category: String,
    pub subcategory: String,
    pub costprice: f64,
    pub saleprice: f64,
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct StoreRecord {
    pub storeid: i32,
    pub storename: String,
    pub city: String,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct SalesRecord {
    pub salesid: i64,
    pub dateid: i32,
    pub productid: i32,
    pub storeid: i32,
    pub quantitysold: i32,
    pub revenue: f64,
}
