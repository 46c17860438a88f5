use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: u64,
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Movie {
    pub id: u64,
    pub name: String,
    pub director: Option<String>,
    pub year: Option<i32>,
    pub poster_url: Option<String>,
    pub user_id: u64,
}

/// A movie that has not been stored yet and therefore has no id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMovie {
    pub name: String,
    pub director: Option<String>,
    pub year: Option<i32>,
    pub poster_url: Option<String>,
    pub user_id: u64,
}

impl NewMovie {
    pub fn with_id(self, id: u64) -> Movie {
        Movie {
            id,
            name: self.name,
            director: self.director,
            year: self.year,
            poster_url: self.poster_url,
            user_id: self.user_id,
        }
    }
}
