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

//! This module implements the objective management of an optimization search:
//! the shared record of the best objective value found so far, and the cut
//! propagator that forces every new solution to strictly improve on it.
//!
//! The best-value record is shared across solver instances (a portfolio run
//! updates it from several threads), hence it lives behind a mutex and its
//! updates are monotonic: a stale improvement can never loosen the bound.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{CPResult, Cause, Constraint, ExplainedStore, Propagator, Variable};

/// The optimization direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectivePolicy {
    /// Ever smaller values of the objective variable are sought
    Minimize,
    /// Ever greater values of the objective variable are sought
    Maximize,
}

/// The objective of an optimization search: a direction, the variable whose
/// value is being optimized, and the best value witnessed so far (if any)
#[derive(Debug, Clone)]
pub struct Objective {
    /// the optimization direction
    pub policy: ObjectivePolicy,
    /// the variable whose value is being optimized
    pub variable: Variable,
    /// the best objective value witnessed so far
    best: Option<isize>,
}
impl Objective {
    /// Creates a fresh objective with no witnessed value yet
    pub fn new(policy: ObjectivePolicy, variable: Variable) -> Self {
        Self {
            policy,
            variable,
            best: None,
        }
    }
    /// The best objective value witnessed so far
    pub fn best(&self) -> Option<isize> {
        self.best
    }
    /// Tightens the record with a newly witnessed value. The update is
    /// monotonic: a value no better than the current record leaves it
    /// untouched. Returns true iff the record actually improved.
    pub fn update_best(&mut self, value: isize) -> bool {
        let improves = match (self.policy, self.best) {
            (_, None) => true,
            (ObjectivePolicy::Minimize, Some(best)) => value < best,
            (ObjectivePolicy::Maximize, Some(best)) => value > best,
        };
        if improves {
            self.best = Some(value);
        }
        improves
    }
}

/// The handle to an objective which is shared among all the solver instances
/// working on the same problem
pub type ObjectiveManager = Arc<Mutex<Objective>>;

/// Creates a shared handle to a fresh objective
pub fn objective_manager(policy: ObjectivePolicy, variable: Variable) -> ObjectiveManager {
    Arc::new(Mutex::new(Objective::new(policy, variable)))
}

/// The cut propagator: it constrains the objective variable to strictly
/// improve on the best value witnessed so far. It is scheduled by the search
/// before every fixpoint so that a bound published by another solver instance
/// takes effect at the next propagation.
pub struct ObjectiveCut {
    manager: ObjectiveManager,
}
impl ObjectiveCut {
    pub fn new(manager: ObjectiveManager) -> Self {
        Self { manager }
    }
}
impl Propagator for ObjectiveCut {
    fn propagate(&mut self, store: &mut dyn ExplainedStore) -> CPResult<()> {
        // copy what we need and release the lock before touching the domains
        let (policy, variable, best) = {
            let objective = self.manager.lock();
            (objective.policy, objective.variable, objective.best())
        };
        let cause = match store.failure() {
            crate::Inconsistency::Propagator(c) => Cause::Propagator(c),
            failure => return Err(failure),
        };
        if let Some(best) = best {
            match policy {
                ObjectivePolicy::Minimize => {
                    store.update_upper_bound(variable, best - 1, &cause)?;
                }
                ObjectivePolicy::Maximize => {
                    store.update_lower_bound(variable, best + 1, &cause)?;
                }
            }
        }
        Ok(())
    }
}

/// Installs the cut propagator of the given shared objective and returns its
/// constraint identifier so the search can schedule it explicitly
pub fn post_cut(
    model: &mut dyn crate::ConstraintStore,
    manager: ObjectiveManager,
) -> Constraint {
    model.post(Box::new(ObjectiveCut::new(manager)))
}

// #############################################################################
// ### UNIT TESTS ##############################################################
// #############################################################################
