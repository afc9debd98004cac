// Thorn: a dynamically-typed scripting language with class syntax, lambdas,
// pattern matching, Result values, dictionaries/arrays and a module system.
//
// Copyright (C) 2019  Brandon Lewis
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.
//
// This crate is the execution core only: scanner, parser, value model,
// environment, tree evaluator, optimizer, bytecode compiler and VM. The
// command-line driver, REPL loop and standard-library host functions are
// external collaborators; see `native::NativeRegistry` and
// `modules::SourceProvider` for the seams they plug into.

extern crate enumflags2;
extern crate serde;
#[macro_use]
extern crate lazy_static;

pub mod token;
pub mod scanner;
pub mod ast;
pub mod value;
pub mod env;
pub mod diagnostics;
pub mod dispatch;
pub mod parser;
pub mod native;
pub mod modules;
pub mod evaluator;
pub mod optimizer;
pub mod bytecode;
pub mod compiler;
pub mod vm;
pub mod config;

pub use diagnostics::Diagnostic;
pub use value::Value;
