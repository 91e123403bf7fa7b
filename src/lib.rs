//! # Pordego (Auth Seeding Gate)
//!
//! `pordego` is a small HTTP service that sits in front of an external
//! authentication handler. Before any request on the authentication sub-path
//! is served, the identity-provider client registry must be seeded into
//! `PostgreSQL` exactly once per process.
//!
//! The crate is organized around a **single-flight readiness gate**:
//!
//! 1. The first `GET`/`POST` on `/api/auth/*` triggers one seeding operation
//!    (load client descriptors from configuration, upsert them into the
//!    `oidc_clients` table).
//! 2. Requests that arrive while seeding is in flight all await the *same*
//!    operation; the store upsert runs exactly once no matter how many
//!    requests race on a cold process.
//! 3. Once the gate is `Ready` it stays `Ready` for the process lifetime and
//!    requests pass straight through to the upstream authentication handler.
//!
//! Failed seeding attempts are reported to every waiting request and then
//! retried by the next request (transient store errors) or surfaced verbatim
//! without a retry (configuration errors).

pub mod cli;
pub mod gate;
pub mod oidc;
pub mod pordego;
