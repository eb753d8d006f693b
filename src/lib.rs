//! Client for the line-oriented register console of PMC motor controllers.
//!
//! The [`session::Session`] is a synchronous, non-blocking engine: the embedding application
//! feeds it a [`transport::Transport`] and calls [`session::Session::fetch`] and
//! [`session::Session::push`] from its own loop. [`connection`] provides a transport over a
//! serial port.
pub mod capture;
pub mod codec;
pub mod commands;
pub mod connection;
pub mod dispatch;
pub mod lexer;
pub mod number;
pub mod output;
pub mod registers;
pub mod scheduler;
pub mod session;
pub mod transport;
