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

//! This module provides the definition and implementation of the variables,
//! DomainStore and DomainBroker.
//!
//! Unlike a plain CP kernel, none of the mutations defined here is meant to
//! be called directly by propagators or by the search. Every domain change
//! must instead go through the explained mutation layer (`ExplainedStore`)
//! which records one deduction per value that is actually eliminated before
//! the domain itself is touched. The primitives below are therefore kept
//! crate private.

use crate::{
    Constraint, ReversibleBool, ReversibleInt, ReversibleSparseSet, SaveAndRestore, StateManager,
    TrailedStateManager,
};

/// This is the kind of error that gets raised whenever a propagation step
/// fails. It carries the agent whose domain (or own logic) witnessed the
/// failure, which is what allows the conflict analysis to build the
/// justification of the dead end.
#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq, Hash)]
pub enum Inconsistency {
    /// The domain of an integer variable has been wiped out
    #[error("empty domain for an integer variable")]
    IntVariable(Variable),
    /// A set variable was asked to both include and exclude a value
    #[error("contradictory membership for a set variable")]
    SetVariable(SetVariable),
    /// A propagator detected the infeasibility on its own
    #[error("failure raised by a propagator")]
    Propagator(Constraint),
}

/// The result of a propagation operation. (Note: all propagation operations
/// can fail, in which case they raise an Inconsistency error)
pub type CPResult<T> = Result<T, Inconsistency>;

/// An integer variable that can be used in a CP model
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Variable(usize);

/// A set variable. It only exists to give the set branching operators
/// something to act on: its domain is an envelope of candidate values and a
/// kernel of values that have been forced in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SetVariable(usize);

/// The target of a branching decision or of a deduction: either an integer
/// variable or a set variable.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TargetVar {
    /// An integer variable
    Int(Variable),
    /// A set variable
    Set(SetVariable),
}

/// The read-only facet of a domain store. This is the view which is handed
/// out to propagators when they justify their prunings, to branchers when
/// they pick the next decision, and to anyone else who must observe the
/// domains without touching them.
pub trait DomainInspect {
    /// Returns the minimum value of the domain of this variable (if it exists)
    fn min(&self, var: Variable) -> Option<isize>;
    /// Returns the maximum value of the domain of this variable (if it exists)
    fn max(&self, var: Variable) -> Option<isize>;
    /// Returns the size of the domain of this variable
    fn size(&self, var: Variable) -> usize;
    /// Returns true iff the domain of the target `var` contains the specified `value`
    fn contains(&self, var: Variable, value: isize) -> bool;
    /// Returns true iff the value of the target variable is fixed/imposed
    fn is_fixed(&self, var: Variable) -> bool {
        self.size(var) == 1
    }
    /// Calls the function f once for each value in the domain of `var`
    fn for_each_value(&self, var: Variable, f: &mut dyn FnMut(isize));

    /// Returns true iff the given value still is a candidate of the set
    /// variable (it has not been excluded)
    fn set_envelope_contains(&self, var: SetVariable, value: isize) -> bool;
    /// Returns true iff the given value has been forced into the set variable
    fn set_kernel_contains(&self, var: SetVariable, value: isize) -> bool;
}

/// A domain store is the entity in charge of the creation of the problem
/// variables and of the raw storage of their domains.
pub trait DomainStore: DomainInspect {
    /// Creates a new integer variable covering the min..=max range of values
    fn new_int_var(&mut self, min: isize, max: isize) -> Variable;
    /// Creates a new binary 0,1 variable
    fn new_bool_var(&mut self) -> Variable {
        self.new_int_var(0, 1)
    }
    /// Creates a new set variable whose envelope initially covers the values
    /// 0..n (none of which belongs to the kernel yet)
    fn new_set_var(&mut self, n: usize) -> SetVariable;
}

/// An event that tells what happened to the domain of a variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainEvent {
    /// This is the variable impacted by a possible change in its domain
    pub variable: Variable,
    /// This flag is set when the domain of the variable has become fixed
    /// (That is, it only has one single value left in its domain)
    pub is_fixed: bool,
    /// This flag is set when the domain of a variable has become empty
    /// (this should somehow have triggered an Inconsistency error)
    pub is_empty: bool,
    /// This flag is set when the domain's minimum has changed
    pub min_changed: bool,
    /// This flag is set when the domain's maximum has changed
    pub max_changed: bool,
    /// This flag is set when a change has occured in the domain of the variable
    /// (this is the weakest of the requirements to set a flag)
    pub domain_changed: bool,
}

/// The domain broker is the facet of the domain store which is in charge of
/// tracking all changes occurring in the domain of the variables. A domain
/// broker is the object which is used by the solver to schedule the
/// propagation of the various propagators and listeners.
pub trait DomainBroker: SaveAndRestore {
    /// forgets all events that have happened on a variable
    fn clear_events(&mut self);
    /// goes over all the events that have occurred on the variables
    fn for_each_event<F: FnMut(DomainEvent)>(&self, f: F);
}

/// This is the type of domain store implementation you will likely want to use
/// in your solver. Currently, this is the only available implementation of a DS
/// but it *might* possibly change in the future.
pub type DefaultDomainStore = DomainStoreImpl<TrailedStateManager>;

/// The data which is kept about one integer variable
#[derive(Debug, Clone, Copy)]
struct IntVarData {
    /// the domain of the variable
    domain: ReversibleSparseSet,
}

/// The data which is kept about one set variable: the envelope is a sparse
/// set of the candidate values and the kernel is one reversible flag per
/// value of the initial envelope
#[derive(Debug, Clone)]
struct SetVarData {
    /// the candidate values
    envelope: ReversibleSparseSet,
    /// kernel membership flags, one per value of the initial envelope
    kernel: Vec<ReversibleBool>,
}

/// This is a simple implementation of a domain store. It implements the
/// DomainStore, DomainInspect and DomainBroker traits, which means it really
/// is an entity that encompasses the complete lifecycle of a variable (but
/// has nothing to do with the higher level constructs that *use* the events
/// applied to these variables)
pub struct DomainStoreImpl<T: StateManager> {
    /// The state manager in charge of saving/restoring the domains states
    state: T,
    /// How many variables are there right now ?
    n_vars: ReversibleInt,
    /// The information about all integer variables
    variables: Vec<IntVarData>,
    /// The events attached to all integer variables
    events: Vec<DomainEvent>,
    /// How many set variables are there right now ?
    n_set_vars: ReversibleInt,
    /// The information about all set variables
    set_variables: Vec<SetVarData>,
}
impl<T: StateManager> DomainStoreImpl<T> {
    /// Creates a new instance of the domain store based on the given state
    /// manager
    pub fn new(state: T) -> Self {
        Self::from(state)
    }
    /// Returns a reference to the underlying state manager
    pub fn state_manager(&self) -> &T {
        &self.state
    }
    /// Returns a mutable reference to the underlying state manager
    pub fn state_manager_mut(&mut self) -> &mut T {
        &mut self.state
    }
}

impl<T: StateManager> From<T> for DomainStoreImpl<T> {
    fn from(mut state: T) -> Self {
        let n_vars = state.manage_int(0);
        let n_set_vars = state.manage_int(0);
        Self {
            state,
            n_vars,
            n_set_vars,
            variables: vec![],
            events: vec![],
            set_variables: vec![],
        }
    }
}
impl<T: StateManager + Default> Default for DomainStoreImpl<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: StateManager> DomainStore for DomainStoreImpl<T> {
    fn new_int_var(&mut self, min: isize, max: isize) -> Variable {
        let id = (self.state.increment(self.n_vars) - 1) as usize;
        let n = (max - min + 1) as usize;

        let variable = Variable(id);
        let domain = self.state.manage_sparse_set(n, min);

        // its a fresh variable
        self.variables.push(IntVarData { domain });
        self.events.push(DomainEvent {
            variable,
            is_fixed: false,
            is_empty: false,
            min_changed: false,
            max_changed: false,
            domain_changed: false,
        });
        variable
    }

    fn new_set_var(&mut self, n: usize) -> SetVariable {
        let id = (self.state.increment(self.n_set_vars) - 1) as usize;
        let envelope = self.state.manage_sparse_set(n, 0);
        let kernel = (0..n).map(|_| self.state.manage_bool(false)).collect();

        self.set_variables.push(SetVarData { envelope, kernel });
        SetVariable(id)
    }
}

impl<T: StateManager> DomainInspect for DomainStoreImpl<T> {
    fn min(&self, var: Variable) -> Option<isize> {
        self.state.sparse_set_get_min(self.variables[var.0].domain)
    }

    fn max(&self, var: Variable) -> Option<isize> {
        self.state.sparse_set_get_max(self.variables[var.0].domain)
    }

    fn size(&self, var: Variable) -> usize {
        self.state.sparse_set_size(self.variables[var.0].domain)
    }

    fn contains(&self, var: Variable, value: isize) -> bool {
        self.state
            .sparse_set_contains(self.variables[var.0].domain, value)
    }

    fn for_each_value(&self, var: Variable, f: &mut dyn FnMut(isize)) {
        self.state
            .sparse_set_for_each(self.variables[var.0].domain, f)
    }

    fn set_envelope_contains(&self, var: SetVariable, value: isize) -> bool {
        self.state
            .sparse_set_contains(self.set_variables[var.0].envelope, value)
    }

    fn set_kernel_contains(&self, var: SetVariable, value: isize) -> bool {
        let data = &self.set_variables[var.0];
        if value < 0 || value as usize >= data.kernel.len() {
            false
        } else {
            self.state.get_bool(data.kernel[value as usize])
        }
    }
}

impl<T: StateManager> SaveAndRestore for DomainStoreImpl<T> {
    fn save_state(&mut self) {
        self.state.save_state()
    }

    fn restore_state(&mut self) {
        self.state.restore_state();
        self.variables
            .truncate(self.state.get_int(self.n_vars) as usize);
        self.events
            .truncate(self.state.get_int(self.n_vars) as usize);
        self.set_variables
            .truncate(self.state.get_int(self.n_set_vars) as usize);
    }

    fn world_index(&self) -> usize {
        self.state.world_index()
    }
}
impl<T: StateManager> DomainBroker for DomainStoreImpl<T> {
    fn clear_events(&mut self) {
        for e in self.events.iter_mut() {
            e.is_empty = false;
            e.is_fixed = false;
            e.min_changed = false;
            e.max_changed = false;
            e.domain_changed = false;
        }
    }

    fn for_each_event<F: FnMut(DomainEvent)>(&self, f: F) {
        self.events
            .iter()
            .copied()
            .filter(|e| e.is_empty | e.is_fixed | e.max_changed | e.min_changed | e.domain_changed)
            .for_each(f);
    }
}
//~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
// crate private mutations (the explained layer is the only caller)
//~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
impl<T: StateManager> DomainStoreImpl<T> {
    /// Fixes the value of an integer variable
    pub(crate) fn int_fix(&mut self, var: Variable, value: isize) -> CPResult<()> {
        let dom = self.variables[var.0].domain;
        let evt = var.0;
        if !self.state.sparse_set_contains(dom, value) {
            self.events[evt].min_changed = true;
            self.events[evt].max_changed = true;
            self.events[evt].domain_changed = true;
            self.events[evt].is_empty = true;
            Err(Inconsistency::IntVariable(var))
        } else if self.state.sparse_set_size(dom) == 1 {
            // if there is nothing to do, then we're done
            Ok(())
        } else {
            let min_changed = self.state.sparse_set_get_min(dom) != Some(value);
            let max_changed = self.state.sparse_set_get_max(dom) != Some(value);
            self.state.sparse_set_remove_all_but(dom, value);

            self.events[evt].min_changed |= min_changed;
            self.events[evt].max_changed |= max_changed;
            self.events[evt].domain_changed = true;
            self.events[evt].is_fixed = true;
            Ok(())
        }
    }
    /// Removes a single value from the domain of an integer variable
    pub(crate) fn int_remove(&mut self, var: Variable, value: isize) -> CPResult<()> {
        let dom = self.variables[var.0].domain;
        let evt = var.0;
        if !self.state.sparse_set_contains(dom, value) {
            // there is nothing to do
            Ok(())
        } else {
            let min_changed = self.state.sparse_set_get_min(dom) == Some(value);
            let max_changed = self.state.sparse_set_get_max(dom) == Some(value);

            let domain_changed = self.state.sparse_set_remove(dom, value);
            let size = self.state.sparse_set_size(dom);
            let is_fixed = size == 1;
            let is_empty = size == 0;

            self.events[evt].min_changed |= min_changed;
            self.events[evt].max_changed |= max_changed;
            self.events[evt].is_fixed |= is_fixed;
            self.events[evt].is_empty |= is_empty;
            self.events[evt].domain_changed |= domain_changed;

            if is_empty {
                Err(Inconsistency::IntVariable(var))
            } else {
                Ok(())
            }
        }
    }
    /// Removes all candidates less than a given value from the domain of an
    /// integer variable
    pub(crate) fn int_remove_below(&mut self, var: Variable, value: isize) -> CPResult<()> {
        let dom = self.variables[var.0].domain;
        let evt = var.0;
        let min_changed = self.state.sparse_set_get_min(dom) < Some(value);
        if min_changed {
            self.state.sparse_set_remove_below(dom, value);
            let size = self.state.sparse_set_size(dom);

            match size {
                0 => {
                    self.events[evt].is_empty = true;
                    Err(Inconsistency::IntVariable(var))
                }
                1 => {
                    self.events[evt].is_fixed = true;
                    self.events[evt].min_changed = true;
                    self.events[evt].domain_changed = true;
                    Ok(())
                }
                _ => {
                    self.events[evt].min_changed = true;
                    self.events[evt].domain_changed = true;
                    Ok(())
                }
            }
        } else {
            // Nothing to do
            Ok(())
        }
    }
    /// Removes all candidates greater than a given value from the domain of
    /// an integer variable
    pub(crate) fn int_remove_above(&mut self, var: Variable, value: isize) -> CPResult<()> {
        let dom = self.variables[var.0].domain;
        let evt = var.0;
        let max_changed = self.state.sparse_set_get_max(dom) > Some(value);
        if max_changed {
            self.state.sparse_set_remove_above(dom, value);
            let size = self.state.sparse_set_size(dom);

            match size {
                0 => {
                    self.events[evt].is_empty = true;
                    Err(Inconsistency::IntVariable(var))
                }
                1 => {
                    self.events[evt].is_fixed = true;
                    self.events[evt].max_changed = true;
                    self.events[evt].domain_changed = true;
                    Ok(())
                }
                _ => {
                    self.events[evt].max_changed = true;
                    self.events[evt].domain_changed = true;
                    Ok(())
                }
            }
        } else {
            // Nothing to do
            Ok(())
        }
    }
    /// Forces a value into the kernel of a set variable. Fails when the value
    /// is no longer a candidate of the envelope.
    pub(crate) fn set_force(&mut self, var: SetVariable, value: isize) -> CPResult<bool> {
        if self.set_kernel_contains(var, value) {
            Ok(false)
        } else if !self.set_envelope_contains(var, value) {
            Err(Inconsistency::SetVariable(var))
        } else {
            let flag = self.set_variables[var.0].kernel[value as usize];
            self.state.set_bool(flag, true);
            Ok(true)
        }
    }
    /// Excludes a value from the envelope of a set variable. Fails when the
    /// value has already been forced into the kernel.
    pub(crate) fn set_exclude(&mut self, var: SetVariable, value: isize) -> CPResult<bool> {
        if !self.set_envelope_contains(var, value) {
            Ok(false)
        } else if self.set_kernel_contains(var, value) {
            Err(Inconsistency::SetVariable(var))
        } else {
            let env = self.set_variables[var.0].envelope;
            self.state.sparse_set_remove(env, value);
            Ok(true)
        }
    }
}

// #############################################################################
// ### UNIT TESTS ##############################################################
// #############################################################################


//~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
//~~~~ DOMAINSTORE (SET VARIABLES) ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
//~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
#[cfg(test)]
mod test_domainstoreimpl_set {
    use super::*;

    #[test]
    fn a_fresh_set_var_has_a_full_envelope_and_an_empty_kernel() {
        let mut ds = DefaultDomainStore::default();
        let s = ds.new_set_var(4);

        for v in 0..4 {
            assert!(ds.set_envelope_contains(s, v));
            assert!(!ds.set_kernel_contains(s, v));
        }
        assert!(!ds.set_envelope_contains(s, 4));
    }

    #[test]
    fn force_moves_a_value_into_the_kernel() {
        let mut ds = DefaultDomainStore::default();
        let s = ds.new_set_var(4);

        assert_eq!(Ok(true), ds.set_force(s, 2));
        assert!(ds.set_kernel_contains(s, 2));
        // forcing twice is a noop
        assert_eq!(Ok(false), ds.set_force(s, 2));
    }

    #[test]
    fn force_of_an_excluded_value_fails() {
        let mut ds = DefaultDomainStore::default();
        let s = ds.new_set_var(4);

        assert_eq!(Ok(true), ds.set_exclude(s, 2));
        assert_eq!(Err(Inconsistency::SetVariable(s)), ds.set_force(s, 2));
    }

    #[test]
    fn exclude_of_a_kernel_value_fails() {
        let mut ds = DefaultDomainStore::default();
        let s = ds.new_set_var(4);

        assert_eq!(Ok(true), ds.set_force(s, 1));
        assert_eq!(Err(Inconsistency::SetVariable(s)), ds.set_exclude(s, 1));
    }

    #[test]
    fn set_mutations_are_reversible() {
        let mut ds = DefaultDomainStore::default();
        let s = ds.new_set_var(3);

        ds.save_state();
        assert_eq!(Ok(true), ds.set_force(s, 0));
        assert_eq!(Ok(true), ds.set_exclude(s, 1));

        ds.restore_state();
        assert!(!ds.set_kernel_contains(s, 0));
        assert!(ds.set_envelope_contains(s, 1));
    }
}
