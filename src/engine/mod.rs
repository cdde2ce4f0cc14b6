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

//! The engine module comprises everything that makes the solver tick: the
//! variables and their domains, the explanation engine and its deduction
//! database, the branching decisions, the propagation model, the objective
//! management and the search driver.

mod domain;
pub use domain::*;

mod explanation;
pub use explanation::*;

mod decision;
pub use decision::*;

mod model;
pub use model::*;

mod objective;
pub use objective::*;

mod search;
pub use search::*;
