// Keg, the lightweight backend of the Musikverein Leopoldsdorf.
// Copyright (C) 2022  Richard Stöckl
//
// This program is free software; you can redistribute it and/or
// modify it under the terms of the GNU General Public License
// as published by the Free Software Foundation; either version 2
// of the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program; if not, write to the Free Software
// Foundation, Inc., 51 Franklin Street, Fifth Floor, Boston, MA  02110-1301, USA.

use thiserror::Error;

/// Crate-wide error type threading failure information from the IdP, storage and
/// validation layers up to the refresh engine and the LDAP protocol handler.
#[derive(Error, Debug)]
pub enum Error {
    /// The identity provider could not be reached, or returned a transport-level failure.
    #[error("identity provider unreachable: {0}")]
    IdpUnreachable(String),

    /// The identity provider rejected a credentials exchange during bind verification.
    #[error("identity provider rejected credentials")]
    CredentialsRejected,

    /// The cached bearer token was rejected or has expired; callers should fetch a new
    /// one and retry exactly once.
    #[error("bearer token expired")]
    TokenExpired,

    /// A single IdP record failed schema validation and was dropped.
    #[error("record failed validation: {0}")]
    RecordInvalid(String),

    /// The configuration failed validation at startup.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The UID allocator's networked backend could not be reached.
    #[error("uid cache unavailable: {0}")]
    UidCacheUnavailable(String),

    /// No previous directory tree generation exists and a rebuild failed.
    #[error("directory unavailable")]
    DirectoryUnavailable,

    /// No entry exists at the requested distinguished name.
    #[error("no such object: {0}")]
    NoSuchObject(String),

    /// A write operation (add, delete, modify, modify-DN) was attempted against the
    /// read-only directory.
    #[error("ReadOnlyLDAPServer will not handle {0}")]
    ReadOnly(&'static str),

    /// An underlying LDAP library exception was caught and wrapped.
    #[error("ldap protocol error: {0}")]
    LdapProtocol(String),

    /// A distinguished name could not be parsed.
    #[error("malformed distinguished name: {0}")]
    MalformedDn(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::IdpUnreachable(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::IdpUnreachable(format!("malformed IdP response: {err}"))
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::ConfigInvalid(err.to_string())
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::UidCacheUnavailable(err.to_string())
    }
}
