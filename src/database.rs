use crate::error::{Error, Result};
use crate::model::*;
use serde::de::DeserializeOwned;
use sled::transaction::{
    abort, ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionResult, Transactional,
};
use sled::IVec;

const USERS: &[u8] = b"users";
const USERS_NAME: &[u8] = b"users_name";
const MOVIES: &[u8] = b"movies";
const USER_MOVIES: &[u8] = b"user_movies";

// Big endian so that keys sort in id order and user prefixes scan correctly.
fn serialize_id(id: u64) -> IVec {
    IVec::from(&id.to_be_bytes()[..])
}

/// Reads the id stored in the last eight bytes of a key or value.
fn deserialize_id<V: AsRef<[u8]>>(bytes: V) -> Option<u64> {
    let bytes = bytes.as_ref();
    let tail = bytes.get(bytes.len().checked_sub(8)?..)?;
    tail.try_into().ok().map(u64::from_be_bytes)
}

fn owner_key(user_id: u64, movie_id: u64) -> IVec {
    let mut key = user_id.to_be_bytes().to_vec();
    key.extend_from_slice(&movie_id.to_be_bytes());
    IVec::from(key)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> ConflictableTransactionResult<T, Error> {
    bincode::deserialize(bytes).map_err(|err| ConflictableTransactionError::Abort(err.into()))
}

fn encode<T: serde::Serialize>(value: &T) -> ConflictableTransactionResult<Vec<u8>, Error> {
    bincode::serialize(value).map_err(|err| ConflictableTransactionError::Abort(err.into()))
}

fn commit<T>(result: TransactionResult<T, Error>) -> Result<T> {
    result.map_err(|err| match err {
        TransactionError::Abort(err) => err,
        TransactionError::Storage(err) => err.into(),
    })
}

pub trait UserDb {
    fn create_user(&self, name: &str) -> Result<User>;
    fn get_users(&self) -> Result<Vec<User>>;
    fn get_user(&self, id: u64) -> Result<Option<User>>;
}

pub trait MovieDb {
    fn get_movies(&self, user_id: u64) -> Result<Vec<Movie>>;
    fn get_movie(&self, id: u64) -> Result<Option<Movie>>;
    fn add_movie(&self, movie: NewMovie) -> Result<Movie>;
    fn update_movie(&self, id: u64, new_title: &str) -> Result<Option<Movie>>;
    fn delete_movie(&self, id: u64) -> Result<Option<Movie>>;
}

impl UserDb for sled::Db {
    fn create_user(&self, name: &str) -> Result<User> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Validation("Please enter a name".to_owned()));
        }
        let users = self.open_tree(USERS)?;
        let users_name = self.open_tree(USERS_NAME)?;
        let id = self.generate_id()?;
        let user = User {
            id,
            name: name.to_owned(),
        };
        let encoded = bincode::serialize(&user)?;
        commit((&users, &users_name).transaction(
            |(users, users_name)| -> ConflictableTransactionResult<(), Error> {
                users.insert(serialize_id(id), encoded.as_slice())?;
                if users_name
                    .insert(user.name.as_bytes(), serialize_id(id))?
                    .is_some()
                {
                    return abort(Error::Validation(format!(
                        "User '{}' already exists",
                        user.name
                    )));
                }
                Ok(())
            },
        ))?;
        Ok(user)
    }

    fn get_users(&self) -> Result<Vec<User>> {
        let users = self.open_tree(USERS)?;
        let users_name = self.open_tree(USERS_NAME)?;
        let mut result = Vec::new();
        for id in users_name.iter().values() {
            match users.get(id?)? {
                Some(data) => result.push(bincode::deserialize(&data)?),
                None => log::warn!("Dangling entry in users_name index"),
            }
        }
        Ok(result)
    }

    fn get_user(&self, id: u64) -> Result<Option<User>> {
        let users = self.open_tree(USERS)?;
        Ok(users
            .get(serialize_id(id))?
            .map(|data| bincode::deserialize(&data))
            .transpose()?)
    }
}

impl MovieDb for sled::Db {
    fn get_movies(&self, user_id: u64) -> Result<Vec<Movie>> {
        let movies = self.open_tree(MOVIES)?;
        let user_movies = self.open_tree(USER_MOVIES)?;
        let mut result: Vec<Movie> = Vec::new();
        for key in user_movies.scan_prefix(serialize_id(user_id)).keys() {
            let movie_id = match deserialize_id(key?) {
                Some(movie_id) => movie_id,
                None => continue,
            };
            match movies.get(serialize_id(movie_id))? {
                Some(data) => result.push(bincode::deserialize(&data)?),
                None => log::warn!("Dangling entry in user_movies index: {}", movie_id),
            }
        }
        result.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(result)
    }

    fn get_movie(&self, id: u64) -> Result<Option<Movie>> {
        let movies = self.open_tree(MOVIES)?;
        Ok(movies
            .get(serialize_id(id))?
            .map(|data| bincode::deserialize(&data))
            .transpose()?)
    }

    fn add_movie(&self, movie: NewMovie) -> Result<Movie> {
        if movie.name.trim().is_empty() {
            return Err(Error::Validation("No title provided".to_owned()));
        }
        let users = self.open_tree(USERS)?;
        let movies = self.open_tree(MOVIES)?;
        let user_movies = self.open_tree(USER_MOVIES)?;
        let id = self.generate_id()?;
        let movie = movie.with_id(id);
        let encoded = bincode::serialize(&movie)?;
        commit((&users, &movies, &user_movies).transaction(
            |(users, movies, user_movies)| -> ConflictableTransactionResult<(), Error> {
                if users.get(serialize_id(movie.user_id))?.is_none() {
                    return abort(Error::NotFound(format!("User {}", movie.user_id)));
                }
                movies.insert(serialize_id(id), encoded.as_slice())?;
                user_movies.insert(owner_key(movie.user_id, id), Vec::<u8>::new())?;
                Ok(())
            },
        ))?;
        Ok(movie)
    }

    fn update_movie(&self, id: u64, new_title: &str) -> Result<Option<Movie>> {
        let new_title = new_title.trim();
        if new_title.is_empty() {
            return Err(Error::Validation("No title provided".to_owned()));
        }
        let movies = self.open_tree(MOVIES)?;
        commit(movies.transaction(
            |movies| -> ConflictableTransactionResult<Option<Movie>, Error> {
                let data = match movies.get(serialize_id(id))? {
                    Some(data) => data,
                    None => return Ok(None),
                };
                let mut movie: Movie = decode(&data)?;
                movie.name = new_title.to_owned();
                movies.insert(serialize_id(id), encode(&movie)?)?;
                Ok(Some(movie))
            },
        ))
    }

    fn delete_movie(&self, id: u64) -> Result<Option<Movie>> {
        let movies = self.open_tree(MOVIES)?;
        let user_movies = self.open_tree(USER_MOVIES)?;
        commit((&movies, &user_movies).transaction(
            |(movies, user_movies)| -> ConflictableTransactionResult<Option<Movie>, Error> {
                let data = match movies.remove(serialize_id(id))? {
                    Some(data) => data,
                    None => return Ok(None),
                };
                let movie: Movie = decode(&data)?;
                user_movies.remove(owner_key(movie.user_id, id))?;
                Ok(Some(movie))
            },
        ))
    }
}
