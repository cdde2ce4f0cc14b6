//
// expcp is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License  v3
// as published by the Free Software Foundation.
//
// expcp is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY.
// See the GNU Lesser General Public License  for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with expcp. If not, see http://www.gnu.org/licenses/lgpl-3.0.en.html
//
// Copyright (c)  2022 by X. Gillard
//

//! expcp is the core of an explanation-based constraint programming solver.
//! It provides the trailed (reversible) state management, the explained
//! domain mutations, a deduction + explanation engine implementing
//! conflict-directed backjumping, the branching decisions and their
//! operators, a bounds-consistent all different propagator, a complete
//! search driver and a parallel portfolio coordinator that races several
//! solver instances on the same problem.

mod state;
pub use state::*;

mod engine;
pub use engine::*;

mod constraints;
pub use constraints::*;

mod portfolio;
pub use portfolio::*;

/// A convenience module meant to be glob imported to bring all the useful
/// types and traits in scope at once
pub mod prelude {
    pub use super::*;
}
