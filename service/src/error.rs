//
// Copyright 2017-2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Error types for the session core

use std::net::SocketAddr;
use thiserror::Error;

/// Result type for operations
pub type Result<T> = std::result::Result<T, NetError>;

/// Why a listener could not be bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindFailure {
    /// Another socket already owns the endpoint
    AddressInUse,
    /// The address does not belong to this host
    AddressUnavailable,
    /// Any other socket error
    Other,
}

impl std::fmt::Display for BindFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindFailure::AddressInUse => write!(f, "address already in use"),
            BindFailure::AddressUnavailable => write!(f, "address unavailable"),
            BindFailure::Other => write!(f, "socket error"),
        }
    }
}

/// Session core error types
#[derive(Debug, Error)]
pub enum NetError {
    /// I/O error from a socket or file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection has been disposed
    #[error("Connection closed")]
    ConnectionClosed,

    /// Session data for this type was already set on the connection
    #[error("Session data {0} is already set")]
    SessionDataAlreadySet(&'static str),

    /// A listener failed to bind
    #[error("Failed to bind {address}: {kind}")]
    Bind {
        /// Endpoint that was being bound
        address: SocketAddr,
        /// Classified cause
        kind: BindFailure,
        /// Underlying socket error
        #[source]
        source: std::io::Error,
    },

    /// No async runtime is available to drive connection I/O
    #[error("No async runtime available")]
    RuntimeUnavailable,

    /// Configuration is invalid
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Crash backup failed
    #[error("Backup failed: {0}")]
    BackupFailed(String),

    /// Generic error with a message
    #[error("{0}")]
    Other(String),
}

impl NetError {
    /// Bind failure classification, if this is a bind error
    pub fn bind_failure(&self) -> Option<BindFailure> {
        match self {
            NetError::Bind { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
