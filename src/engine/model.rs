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

//! This module provides the definition and implementation of the traits and
//! structure related to the constraint propagation, and of the explained
//! mutation layer sitting between the propagators and the raw domains.

use std::collections::hash_map::Entry;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    CPResult, Cause, Conflict, Decision, Deduction, DomainBroker, DomainInspect, DomainStore,
    DomainStoreImpl, Explanation, ExplanationEngine, IncoherentState, Inconsistency, ReversibleInt,
    SaveAndRestore, SetVariable, StateManager, TrailedStateManager, Variable,
};

/// This trait stands for the modeling constructs which you'll want to work
/// with when representing the problem you intend to solve. These modeling
/// constructs are often referred to as constraints, but this implementation
/// reserves the constraint type for an atomic constraint associated with
/// a propagator.
pub trait ModelingConstruct {
    /// This method installs the current modeling construct (which might
    /// consist of several underlying propagators/constraints) into the
    /// constraint store which will schedule its propagators as needed.
    fn install(&self, constraint_store: &mut dyn ConstraintStore);
}

/// An identifier to a constraint. A constraint in itself is really just
/// an identifier in this implementation. The bulk of the work is done by
/// the solver.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Constraint(usize);
impl Constraint {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index)
    }
}

/// The entailment status of a propagator with respect to the current domains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entailment {
    /// The constraint holds in every completion of the current domains
    Entailed,
    /// The constraint holds in no completion of the current domains
    Violated,
    /// Neither of the above can be decided yet
    Undefined,
}

/// The explained facet of the model: this is the *only* mutable view of the
/// domains that propagators and the search ever get. Each mutation states on
/// behalf of whom it is performed (the cause) so that one deduction can be
/// recorded for every value that is actually eliminated, *before* the domain
/// itself is touched. All mutations return a flag telling whether the domain
/// actually changed.
pub trait ExplainedStore: DomainInspect {
    /// Removes one value from the domain of an integer variable
    fn remove_value(&mut self, var: Variable, value: isize, cause: &Cause) -> CPResult<bool>;
    /// Removes all values strictly less than `value`
    fn update_lower_bound(&mut self, var: Variable, value: isize, cause: &Cause)
        -> CPResult<bool>;
    /// Removes all values strictly greater than `value`
    fn update_upper_bound(&mut self, var: Variable, value: isize, cause: &Cause)
        -> CPResult<bool>;
    /// Fixes the variable to the given value
    fn instantiate_to(&mut self, var: Variable, value: isize, cause: &Cause) -> CPResult<bool>;
    /// Forces a value into the kernel of a set variable
    fn set_force(&mut self, var: SetVariable, value: isize, cause: &Cause) -> CPResult<bool>;
    /// Excludes a value from the envelope of a set variable
    fn set_exclude(&mut self, var: SetVariable, value: isize, cause: &Cause) -> CPResult<bool>;
    /// The inconsistency a propagator must raise when its own reasoning
    /// (rather than a domain wipeout) detects the infeasibility
    fn failure(&self) -> Inconsistency;
}

/// The propagator is the portion of the code where the magic actually happens.
/// A propagator is called by the solver during the fixpoint computation. It
/// enforces a certain level of consistency on the domain of the variables it
/// works on. On top of filtering, an explained propagator must be able to
/// justify its deeds: `why` is called (lazily, once its propagation step has
/// returned) for each value the step eliminated.
pub trait Propagator: Send {
    /// Actually runs the custom propagation algorithm
    fn propagate(&mut self, store: &mut dyn ExplainedStore) -> CPResult<()>;
    /// Justifies one pruning performed by the last propagation step: the
    /// premises under which the deduction was made must be added to the
    /// given explanation
    fn why(
        &self,
        _deduction: Deduction,
        _domains: &dyn DomainInspect,
        _explanations: &ExplanationEngine,
        _explanation: &mut Explanation,
    ) {
    }
    /// Justifies a failure this propagator raised on its own
    fn explain_failure(
        &self,
        _domains: &dyn DomainInspect,
        _explanations: &ExplanationEngine,
        _explanation: &mut Explanation,
    ) {
    }
    /// Tells whether this propagator is entailed by the current domains
    fn is_entailed(&self, _domains: &dyn DomainInspect) -> Entailment {
        Entailment::Undefined
    }
}

/// Any closure/function that accepts a mutable ref to the explained store can
/// be a propagator. (This is mere convenience, not required to get something
/// useable)
impl<F: FnMut(&mut dyn ExplainedStore) -> CPResult<()> + Send> Propagator for F {
    fn propagate(&mut self, store: &mut dyn ExplainedStore) -> CPResult<()> {
        self(store)
    }
}

/// A condition expressing that a specific change event has occurred on the
/// domain of some variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainCondition {
    /// This condidion is satisfied whenever the domain of a variable becomes
    /// fixed
    IsFixed(Variable),
    /// The minimum value of the domain has changed
    MinimumChanged(Variable),
    /// The maximum value of the domain has changed
    MaximumChanged(Variable),
    /// This condition is satisfied when +something+ has changed in the domain
    /// of the variable
    DomainChanged(Variable),
}

/// A constraint store is the entity responsible for storing the constraints
/// (hence the name), enforcing the consistency of these constraints using
/// propagators when the domains of the variables change.
pub trait ConstraintStore {
    /// Installs a given modeling constuct into the constraint store
    fn install(&mut self, modeling_construct: &dyn ModelingConstruct);
    /// Posts the given propagator but does not schedule it
    fn post(&mut self, propagator: Box<dyn Propagator>) -> Constraint;
    /// Schedules the execution of a given constraint (propagator)
    fn schedule(&mut self, constraint: Constraint);
    /// Tells the solver that the given constraint should be propagated whenever
    /// the condition is satisfied
    fn propagate_on(&mut self, constraint: Constraint, cond: DomainCondition);
    /// Propagate all constraints until a fixpoint is reached
    fn fixpoint(&mut self) -> CPResult<()>;
}

/// The basic expectation of a CP model is that it lets us create variables
/// (hence the DomainStore responsibility), mutate their domains in an
/// explained fashion (hence the ExplainedStore responsibility), install
/// constraints bearing on these variables (hence the ConstraintStore
/// responsibility) and that its state can be efficiently saved and restored
/// to a previous snapshot during the search (hence the SaveAndRestore
/// responsibility).
pub trait CpModel: DomainStore + ExplainedStore + ConstraintStore + SaveAndRestore {}

/// This is the type of the CP model you will likely want to work with.
/// Currently, this is the only available implementation of a CP Model, but it
/// *might* possibly change in the future.
pub type DefaultCpModel = CpModelImpl<TrailedStateManager>;

//~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
//~~~~ EXPLAINED MUTATIONS ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
//~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
// These free functions implement the explained mutation protocol once; they
// back both the model itself and the borrowed context handed to propagators
// during the fixpoint. The protocol is: check for a no-op first, record one
// deduction per value that is about to disappear, and only then touch the
// domain. A failing mutation hence still exposes its premises.

fn explained_remove<T: StateManager>(
    domains: &mut DomainStoreImpl<T>,
    explanations: &mut ExplanationEngine,
    var: Variable,
    value: isize,
    cause: &Cause,
) -> CPResult<bool> {
    if !domains.contains(var, value) {
        return Ok(false);
    }
    let ded = explanations.removal_of(var, value);
    explanations.record(ded, cause);
    domains.int_remove(var, value)?;
    Ok(true)
}

fn explained_remove_below<T: StateManager>(
    domains: &mut DomainStoreImpl<T>,
    explanations: &mut ExplanationEngine,
    var: Variable,
    value: isize,
    cause: &Cause,
) -> CPResult<bool> {
    match domains.min(var) {
        None => return Err(Inconsistency::IntVariable(var)),
        Some(lo) if lo >= value => return Ok(false),
        Some(_) => {}
    }
    let mut eliminated = vec![];
    domains.for_each_value(var, &mut |v| {
        if v < value {
            eliminated.push(v)
        }
    });
    for v in eliminated {
        let ded = explanations.removal_of(var, v);
        explanations.record(ded, cause);
    }
    domains.int_remove_below(var, value)?;
    Ok(true)
}

fn explained_remove_above<T: StateManager>(
    domains: &mut DomainStoreImpl<T>,
    explanations: &mut ExplanationEngine,
    var: Variable,
    value: isize,
    cause: &Cause,
) -> CPResult<bool> {
    match domains.max(var) {
        None => return Err(Inconsistency::IntVariable(var)),
        Some(hi) if hi <= value => return Ok(false),
        Some(_) => {}
    }
    let mut eliminated = vec![];
    domains.for_each_value(var, &mut |v| {
        if v > value {
            eliminated.push(v)
        }
    });
    for v in eliminated {
        let ded = explanations.removal_of(var, v);
        explanations.record(ded, cause);
    }
    domains.int_remove_above(var, value)?;
    Ok(true)
}

fn explained_fix<T: StateManager>(
    domains: &mut DomainStoreImpl<T>,
    explanations: &mut ExplanationEngine,
    var: Variable,
    value: isize,
    cause: &Cause,
) -> CPResult<bool> {
    if !domains.contains(var, value) {
        // raises the empty event and errs; the removals responsible for the
        // absence of the value have been recorded when they happened
        return domains.int_fix(var, value).map(|_| false);
    }
    if domains.is_fixed(var) {
        return Ok(false);
    }
    let mut eliminated = vec![];
    domains.for_each_value(var, &mut |v| {
        if v != value {
            eliminated.push(v)
        }
    });
    for v in eliminated {
        let ded = explanations.removal_of(var, v);
        explanations.record(ded, cause);
    }
    let assignment = explanations.assignment_of(var, value);
    explanations.record(assignment, cause);
    domains.int_fix(var, value)?;
    Ok(true)
}

fn explained_set_force<T: StateManager>(
    domains: &mut DomainStoreImpl<T>,
    explanations: &mut ExplanationEngine,
    var: SetVariable,
    value: isize,
    cause: &Cause,
) -> CPResult<bool> {
    if domains.set_kernel_contains(var, value) {
        return Ok(false);
    }
    let ded = explanations.set_assignment_of(var, value);
    explanations.record(ded, cause);
    domains.set_force(var, value)
}

fn explained_set_exclude<T: StateManager>(
    domains: &mut DomainStoreImpl<T>,
    explanations: &mut ExplanationEngine,
    var: SetVariable,
    value: isize,
    cause: &Cause,
) -> CPResult<bool> {
    if !domains.set_envelope_contains(var, value) {
        return Ok(false);
    }
    let ded = explanations.set_removal_of(var, value);
    explanations.record(ded, cause);
    domains.set_exclude(var, value)
}

/// The borrowed view of the model which is handed out to propagators during
/// the fixpoint computation. It knows which propagator is currently running,
/// which is what gives `failure()` its meaning.
struct PropagationContext<'a, T: StateManager> {
    domains: &'a mut DomainStoreImpl<T>,
    explanations: &'a mut ExplanationEngine,
    active: Constraint,
}
impl<T: StateManager> DomainInspect for PropagationContext<'_, T> {
    fn min(&self, var: Variable) -> Option<isize> {
        self.domains.min(var)
    }
    fn max(&self, var: Variable) -> Option<isize> {
        self.domains.max(var)
    }
    fn size(&self, var: Variable) -> usize {
        self.domains.size(var)
    }
    fn contains(&self, var: Variable, value: isize) -> bool {
        self.domains.contains(var, value)
    }
    fn for_each_value(&self, var: Variable, f: &mut dyn FnMut(isize)) {
        self.domains.for_each_value(var, f)
    }
    fn set_envelope_contains(&self, var: SetVariable, value: isize) -> bool {
        self.domains.set_envelope_contains(var, value)
    }
    fn set_kernel_contains(&self, var: SetVariable, value: isize) -> bool {
        self.domains.set_kernel_contains(var, value)
    }
}
impl<T: StateManager> ExplainedStore for PropagationContext<'_, T> {
    fn remove_value(&mut self, var: Variable, value: isize, cause: &Cause) -> CPResult<bool> {
        explained_remove(self.domains, self.explanations, var, value, cause)
    }
    fn update_lower_bound(
        &mut self,
        var: Variable,
        value: isize,
        cause: &Cause,
    ) -> CPResult<bool> {
        explained_remove_below(self.domains, self.explanations, var, value, cause)
    }
    fn update_upper_bound(
        &mut self,
        var: Variable,
        value: isize,
        cause: &Cause,
    ) -> CPResult<bool> {
        explained_remove_above(self.domains, self.explanations, var, value, cause)
    }
    fn instantiate_to(&mut self, var: Variable, value: isize, cause: &Cause) -> CPResult<bool> {
        explained_fix(self.domains, self.explanations, var, value, cause)
    }
    fn set_force(&mut self, var: SetVariable, value: isize, cause: &Cause) -> CPResult<bool> {
        explained_set_force(self.domains, self.explanations, var, value, cause)
    }
    fn set_exclude(&mut self, var: SetVariable, value: isize, cause: &Cause) -> CPResult<bool> {
        explained_set_exclude(self.domains, self.explanations, var, value, cause)
    }
    fn failure(&self) -> Inconsistency {
        Inconsistency::Propagator(self.active)
    }
}

//~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
//~~~~ THE MODEL ITSELF ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
//~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~

/// This is a simple implementation of an explained CP model.
///
/// # Note
/// Because it would be very inconvenient to always force a client to go
/// through the domain store of the constraint store, I let this struct be a
/// domain store with save and restore capabilities. The implementation of
/// these traits is simply delegated to another structure that actually
/// implements some business logic for it.
pub struct CpModelImpl<T: StateManager> {
    /// The domain store which is used to manage the problem variables
    domains: DomainStoreImpl<T>,
    /// The engine remembering why every value ever left a domain
    explanations: ExplanationEngine,
    /// This establishes a correspondence between a domain condition and all
    /// the porpagators that need to be scheduled
    listeners: FxHashMap<DomainCondition, FxHashSet<Constraint>>,

    /// These are the propagators that might be used to effectively trim down
    /// the variable domains
    propagators: Vec<Box<dyn Propagator>>,
    /// This list tracks the associations that have been made between a domain
    /// condition and a propagator. The whole point of keeping this list is to
    /// be able to undo the associations upon state restoration (in conjunction
    /// with the conditions_sz field)
    conditions: Vec<(DomainCondition, Constraint)>,
    /// This tracks the length of the propagators that are active at any given
    /// point in time. The point of this variable is to be able to drop the
    /// propagators as soon as they are no longer required.
    propagator_sz: ReversibleInt,
    /// This field tracks the lenght of the `conditions` field. The point here
    /// is to be able to identify the conditions that need to be undone upon
    /// state restoration.
    conditions_sz: ReversibleInt,

    /// This field is merely used to track the constraints that have been
    /// scheduled for propagation
    scheduled: FxHashSet<Constraint>,
}
impl<T: StateManager> CpModel for CpModelImpl<T> {}
//------------------------------------------------------------------------------
// Domain store facet
//------------------------------------------------------------------------------
impl<T: StateManager> DomainStore for CpModelImpl<T> {
    fn new_int_var(&mut self, min: isize, max: isize) -> Variable {
        self.domains.new_int_var(min, max)
    }
    fn new_set_var(&mut self, n: usize) -> SetVariable {
        self.domains.new_set_var(n)
    }
}
impl<T: StateManager> DomainInspect for CpModelImpl<T> {
    fn min(&self, var: Variable) -> Option<isize> {
        self.domains.min(var)
    }
    fn max(&self, var: Variable) -> Option<isize> {
        self.domains.max(var)
    }
    fn size(&self, var: Variable) -> usize {
        self.domains.size(var)
    }
    fn contains(&self, var: Variable, value: isize) -> bool {
        self.domains.contains(var, value)
    }
    fn for_each_value(&self, var: Variable, f: &mut dyn FnMut(isize)) {
        self.domains.for_each_value(var, f)
    }
    fn set_envelope_contains(&self, var: SetVariable, value: isize) -> bool {
        self.domains.set_envelope_contains(var, value)
    }
    fn set_kernel_contains(&self, var: SetVariable, value: isize) -> bool {
        self.domains.set_kernel_contains(var, value)
    }
}
//------------------------------------------------------------------------------
// Explained store facet
//------------------------------------------------------------------------------
impl<T: StateManager> ExplainedStore for CpModelImpl<T> {
    fn remove_value(&mut self, var: Variable, value: isize, cause: &Cause) -> CPResult<bool> {
        explained_remove(&mut self.domains, &mut self.explanations, var, value, cause)
    }
    fn update_lower_bound(
        &mut self,
        var: Variable,
        value: isize,
        cause: &Cause,
    ) -> CPResult<bool> {
        explained_remove_below(&mut self.domains, &mut self.explanations, var, value, cause)
    }
    fn update_upper_bound(
        &mut self,
        var: Variable,
        value: isize,
        cause: &Cause,
    ) -> CPResult<bool> {
        explained_remove_above(&mut self.domains, &mut self.explanations, var, value, cause)
    }
    fn instantiate_to(&mut self, var: Variable, value: isize, cause: &Cause) -> CPResult<bool> {
        explained_fix(&mut self.domains, &mut self.explanations, var, value, cause)
    }
    fn set_force(&mut self, var: SetVariable, value: isize, cause: &Cause) -> CPResult<bool> {
        explained_set_force(&mut self.domains, &mut self.explanations, var, value, cause)
    }
    fn set_exclude(&mut self, var: SetVariable, value: isize, cause: &Cause) -> CPResult<bool> {
        explained_set_exclude(&mut self.domains, &mut self.explanations, var, value, cause)
    }
    fn failure(&self) -> Inconsistency {
        // only a running propagator may blame itself for a failure
        panic!("failure() called outside of any propagation step")
    }
}
//------------------------------------------------------------------------------
// Save and Restore management
//------------------------------------------------------------------------------
impl<T: StateManager> SaveAndRestore for CpModelImpl<T> {
    fn save_state(&mut self) {
        self.domains.save_state()
    }

    fn restore_state(&mut self) {
        self.domains.restore_state();

        let prop_sz = self.prop_size();
        let cond_sz = self.cond_size();
        self.propagators.truncate(prop_sz);

        for (cond, prop) in self.conditions.iter().skip(cond_sz).copied() {
            if let Entry::Occupied(mut e) = self.listeners.entry(cond) {
                e.get_mut().remove(&prop);
                if e.get().is_empty() {
                    e.remove_entry();
                }
            }
        }

        self.conditions.truncate(cond_sz);
        self.scheduled.clear();
        self.explanations.clear_pending();
    }

    fn world_index(&self) -> usize {
        self.domains.world_index()
    }
}
//------------------------------------------------------------------------------
// Constraint store
//------------------------------------------------------------------------------
impl<T: StateManager> ConstraintStore for CpModelImpl<T> {
    fn install(&mut self, modeling_construct: &dyn ModelingConstruct) {
        modeling_construct.install(self)
    }

    fn post(&mut self, propagator: Box<dyn Propagator>) -> Constraint {
        self.propagators.push(propagator);
        Constraint(self.inc_prop_size() - 1)
    }

    fn schedule(&mut self, constraint: Constraint) {
        self.scheduled.insert(constraint);
    }

    fn propagate_on(&mut self, constraint: Constraint, cond: DomainCondition) {
        let mut must_push = false;
        match self.listeners.entry(cond) {
            Entry::Occupied(mut e) => {
                let v = e.get_mut();
                if !v.contains(&constraint) {
                    v.insert(constraint);
                    must_push = true;
                }
            }
            Entry::Vacant(e) => {
                let mut v = FxHashSet::default();
                v.insert(constraint);
                e.insert(v);
                must_push = true;
            }
        }

        if must_push {
            self.conditions.push((cond, constraint));
            self.inc_cond_size();
        }
    }

    fn fixpoint(&mut self) -> CPResult<()> {
        loop {
            self.schedule_relevant();
            let must_stop = self.scheduled.is_empty();
            if must_stop {
                return CPResult::Ok(());
            } else {
                let work: Vec<Constraint> = self.scheduled.drain().collect();
                log::trace!("fixpoint runs {} scheduled propagators", work.len());
                for constraint in work {
                    let result = {
                        let mut context = PropagationContext {
                            domains: &mut self.domains,
                            explanations: &mut self.explanations,
                            active: constraint,
                        };
                        self.propagators[constraint.0].propagate(&mut context)
                    };
                    // the step is over: ask the propagator for the premises
                    // of each value it eliminated (even when it failed, the
                    // prunings made before failing did happen)
                    self.flush_justifications();
                    result?;
                }
            }
        }
    }
}

impl<T: StateManager> From<T> for CpModelImpl<T> {
    fn from(sm: T) -> Self {
        Self::new(sm)
    }
}
impl<T: StateManager + Default> Default for CpModelImpl<T> {
    fn default() -> Self {
        Self::from(T::default())
    }
}
// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
// ~~~ UTILITY METHODS ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
// ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
impl<T: StateManager> CpModelImpl<T> {
    /// Creates a new instance of the constraint store
    pub fn new(mut sm: T) -> Self {
        let conditions_sz = sm.manage_int(0);
        let propagator_sz = sm.manage_int(0);
        Self {
            domains: DomainStoreImpl::from(sm),
            explanations: ExplanationEngine::new(),
            listeners: Default::default(),
            propagators: Default::default(),
            conditions: Default::default(),
            propagator_sz,
            conditions_sz,
            scheduled: Default::default(),
        }
    }
    /// Gives access to the explanation engine
    pub fn explanations(&self) -> &ExplanationEngine {
        &self.explanations
    }
    /// Gives mutable access to the explanation engine
    pub fn explanations_mut(&mut self) -> &mut ExplanationEngine {
        &mut self.explanations
    }
    /// Analyzes a dead end: builds the root explanation of the given failure
    /// and lets the explanation engine decide which world must be refuted
    pub fn analyze(
        &mut self,
        failure: Inconsistency,
        decisions: &[Decision],
    ) -> Result<Option<Conflict>, IncoherentState> {
        let root = self.explain_inconsistency(failure);
        self.explanations.analyze(root, decisions)
    }
    /// Builds the root explanation of an inconsistency
    fn explain_inconsistency(&self, failure: Inconsistency) -> Explanation {
        match failure {
            Inconsistency::IntVariable(x) => self.explanations.explain_domain(&self.domains, x),
            Inconsistency::SetVariable(s) => {
                self.explanations.explain_set_domain(&self.domains, s)
            }
            Inconsistency::Propagator(c) => {
                let mut explanation = Explanation::new();
                explanation.add_cause(c);
                self.propagators[c.0].explain_failure(
                    &self.domains,
                    &self.explanations,
                    &mut explanation,
                );
                explanation
            }
        }
    }
    /// Asks the propagators for the justification of every pruning they
    /// performed during the last propagation step and stores those
    /// justifications in the causal database
    fn flush_justifications(&mut self) {
        while let Some((constraint, ded)) = self.explanations.pop_pending() {
            let mut explanation = Explanation::new();
            explanation.add_cause(constraint);
            let fact = self.explanations.deduction(ded);
            self.propagators[constraint.0].why(
                fact,
                &self.domains,
                &self.explanations,
                &mut explanation,
            );
            self.explanations.store(ded, explanation);
        }
    }
    /// Utility to reach the underlying state manager
    fn sm(&self) -> &T {
        self.domains.state_manager()
    }
    /// Utility to reach the underlying state manager in a mutable way
    fn sm_mut(&mut self) -> &mut T {
        self.domains.state_manager_mut()
    }
    /// returns the size of the propagators list
    fn prop_size(&self) -> usize {
        self.sm().get_int(self.propagator_sz) as usize
    }
    /// increments the size of the propagators list
    fn inc_prop_size(&mut self) -> usize {
        let var = self.propagator_sz;
        self.sm_mut().increment(var) as usize
    }
    /// returns the size of the conditions vector
    fn cond_size(&self) -> usize {
        self.sm().get_int(self.conditions_sz) as usize
    }
    /// increments the size of the conditions list
    fn inc_cond_size(&mut self) -> usize {
        let var = self.conditions_sz;
        self.sm_mut().increment(var) as usize
    }

    /// Schedules the execution of all the relevant propagators and clears the
    /// current set of events
    fn schedule_relevant(&mut self) {
        let schedule = &mut self.scheduled;
        let domains = &mut self.domains;
        let listeners = &self.listeners;

        domains.for_each_event(|e| {
            if e.is_fixed {
                let cond = DomainCondition::IsFixed(e.variable);
                Self::schedule_cond(cond, listeners, schedule);
            }
            if e.min_changed {
                let cond = DomainCondition::MinimumChanged(e.variable);
                Self::schedule_cond(cond, listeners, schedule);
            }
            if e.max_changed {
                let cond = DomainCondition::MaximumChanged(e.variable);
                Self::schedule_cond(cond, listeners, schedule);
            }
            if e.domain_changed {
                let cond = DomainCondition::DomainChanged(e.variable);
                Self::schedule_cond(cond, listeners, schedule);
            }
        });
        domains.clear_events();
    }
    /// Effectively schedule all propagators attached to a given condition
    fn schedule_cond(
        condition: DomainCondition,
        listeners: &FxHashMap<DomainCondition, FxHashSet<Constraint>>,
        sched: &mut FxHashSet<Constraint>,
    ) {
        if let Some(l) = listeners.get(&condition) {
            sched.extend(l.iter())
        }
    }
}

// #############################################################################
// ### UNIT TESTS ##############################################################
// #############################################################################

//~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
//~~~~ QUICK CHECK THAT IT WORKS ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
//~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
#[cfg(test)]
mod test_default_model_quickcheck {
    use crate::*;

    // the cause a propagator cites when it prunes on its own behalf
    fn me(dom: &dyn ExplainedStore) -> Cause {
        match dom.failure() {
            Inconsistency::Propagator(c) => Cause::Propagator(c),
            _ => unreachable!(),
        }
    }

    #[test]
    fn it_works() {
        let mut solver = DefaultCpModel::default();

        let x = solver.new_int_var(5, 10);
        let y = solver.new_bool_var();

        let cx = solver.post(Box::new(move |dom: &mut dyn ExplainedStore| {
            let cause = me(dom);
            dom.instantiate_to(y, 1, &cause)?;
            Ok(())
        }));

        let cy = solver.post(Box::new(move |dom: &mut dyn ExplainedStore| {
            if dom.min(x) >= Some(7) {
                let cause = me(dom);
                dom.instantiate_to(y, 0, &cause)?;
                dom.instantiate_to(x, 7, &cause)?;
                Ok(())
            } else {
                Ok(())
            }
        }));

        solver.propagate_on(cx, DomainCondition::IsFixed(x));
        solver.propagate_on(cy, DomainCondition::DomainChanged(x));
        solver.save_state();

        assert_eq!(Ok(true), solver.update_lower_bound(x, 6, &Cause::Branch(1)));
        assert_eq!(Ok(()), solver.fixpoint());
        solver.save_state();

        assert_eq!(Ok(true), solver.remove_value(x, 6, &Cause::Branch(2)));
        assert!(solver.fixpoint().is_err());
        solver.restore_state();

        assert_eq!(5, solver.size(x));
        assert_eq!(2, solver.size(y));
    }

    #[test]
    fn restore_unschedules_all_scheduled_propagators() {
        let mut model = DefaultCpModel::default();
        let c = model.post(Box::new(move |dom: &mut dyn ExplainedStore| {
            CPResult::Err(dom.failure())
        }));
        model.save_state();
        model.schedule(c);
        model.restore_state();
        assert_eq!(Ok(()), model.fixpoint());
    }

    #[test]
    fn restore_drops_stale_propagators_and_conditions() {
        let mut model = DefaultCpModel::default();
        let x = model.new_int_var(0, 9);

        model.save_state();
        let c = model.post(Box::new(move |dom: &mut dyn ExplainedStore| {
            let cause = me(dom);
            dom.instantiate_to(x, 7, &cause)?;
            Ok(())
        }));
        model.propagate_on(c, DomainCondition::DomainChanged(x));
        assert_eq!(1, model.prop_size());
        assert_eq!(1, model.cond_size());

        model.restore_state();
        assert_eq!(0, model.prop_size());
        assert_eq!(0, model.cond_size());
        assert_eq!(0, model.propagators.len());
        assert_eq!(0, model.conditions.len());

        // the dropped propagator must not react anymore
        assert_eq!(Ok(true), model.remove_value(x, 0, &Cause::Branch(0)));
        assert_eq!(Ok(()), model.fixpoint());
        assert_eq!(9, model.size(x));
    }
}

//~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
//~~~~ EXPLAINED MUTATIONS ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
//~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
#[cfg(test)]
mod test_explained_mutations {
    use crate::*;

    #[test]
    fn a_mutation_that_changes_nothing_reports_false() {
        let mut cp = DefaultCpModel::default();
        let x = cp.new_int_var(0, 9);

        assert_eq!(Ok(false), cp.remove_value(x, 42, &Cause::Branch(1)));
        assert_eq!(Ok(false), cp.update_lower_bound(x, 0, &Cause::Branch(1)));
        assert_eq!(Ok(false), cp.update_upper_bound(x, 9, &Cause::Branch(1)));
    }

    #[test]
    fn remove_value_records_one_branch_fact() {
        let mut cp = DefaultCpModel::default();
        let x = cp.new_int_var(0, 9);

        assert_eq!(Ok(true), cp.remove_value(x, 3, &Cause::Branch(2)));

        let ded = cp.explanations_mut().removal_of(x, 3);
        assert_eq!(Ok(2), cp.explanations().world_number(ded));
    }

    #[test]
    fn update_lower_bound_records_one_fact_per_eliminated_value() {
        let mut cp = DefaultCpModel::default();
        let x = cp.new_int_var(0, 9);

        assert_eq!(Ok(true), cp.update_lower_bound(x, 3, &Cause::Branch(1)));

        for v in 0..3 {
            let ded = cp.explanations_mut().removal_of(x, v);
            assert_eq!(Ok(1), cp.explanations().world_number(ded));
        }
        // values still in the domain have no recorded world
        let ded = cp.explanations_mut().removal_of(x, 5);
        assert_eq!(Err(IncoherentState), cp.explanations().world_number(ded));
    }

    #[test]
    fn instantiate_records_the_removals_and_the_assignment() {
        let mut cp = DefaultCpModel::default();
        let x = cp.new_int_var(0, 3);

        assert_eq!(Ok(true), cp.instantiate_to(x, 2, &Cause::Branch(1)));

        let asg = cp.explanations_mut().assignment_of(x, 2);
        assert_eq!(Ok(1), cp.explanations().world_number(asg));
        for v in [0, 1, 3] {
            let ded = cp.explanations_mut().removal_of(x, v);
            assert_eq!(Ok(1), cp.explanations().world_number(ded));
        }
    }

    #[test]
    fn a_wipeout_still_records_its_premises() {
        let mut cp = DefaultCpModel::default();
        let x = cp.new_int_var(0, 4);

        assert_eq!(
            Err(Inconsistency::IntVariable(x)),
            cp.update_lower_bound(x, 10, &Cause::Branch(1))
        );
        for v in 0..=4 {
            let ded = cp.explanations_mut().removal_of(x, v);
            assert_eq!(Ok(1), cp.explanations().world_number(ded));
        }
    }

    #[test]
    fn stale_set_facts_of_an_abandoned_branch_are_not_cited() {
        let mut cp = DefaultCpModel::default();
        let s = cp.new_set_var(4);

        cp.save_state();
        assert_eq!(Ok(true), cp.set_exclude(s, 0, &Cause::Branch(1)));
        cp.restore_state();

        // value 0 is back in limbo: its exclusion belongs to a dead branch
        cp.save_state();
        assert_eq!(Ok(true), cp.set_exclude(s, 1, &Cause::Branch(1)));

        let stale = cp.explanations_mut().set_removal_of(s, 0);
        let fresh = cp.explanations_mut().set_removal_of(s, 1);
        let cited = cp.explanations().explain_set_domain(&cp, s);
        assert!(!cited.contains(stale));
        assert!(cited.contains(fresh));
    }

    #[test]
    fn a_failed_set_mutation_still_cites_its_own_fact() {
        let mut cp = DefaultCpModel::default();
        let s = cp.new_set_var(4);

        assert_eq!(Ok(true), cp.set_exclude(s, 2, &Cause::Branch(1)));
        assert_eq!(
            Err(Inconsistency::SetVariable(s)),
            cp.set_force(s, 2, &Cause::Branch(2))
        );

        let excluded = cp.explanations_mut().set_removal_of(s, 2);
        let forced = cp.explanations_mut().set_assignment_of(s, 2);
        let cited = cp.explanations().explain_set_domain(&cp, s);
        assert!(cited.contains(excluded));
        assert!(cited.contains(forced));
    }

    #[test]
    fn justified_mutations_land_in_the_causal_database() {
        let mut cp = DefaultCpModel::default();
        let x = cp.new_int_var(0, 9);

        assert_eq!(Ok(true), cp.remove_value(x, 0, &Cause::Branch(1)));
        let premise = cp.explanations_mut().removal_of(x, 0);

        let mut justification = Explanation::new();
        justification.add(premise);
        assert_eq!(
            Ok(true),
            cp.remove_value(x, 1, &Cause::Justified(justification))
        );

        let derived = cp.explanations_mut().removal_of(x, 1);
        let stored = cp.explanations().retrieve(derived).unwrap();
        assert!(stored.contains(premise));
    }

    #[test]
    fn propagator_prunings_are_justified_once_the_step_is_over() {
        let mut cp = DefaultCpModel::default();
        let x = cp.new_int_var(0, 9);

        let c = cp.post(Box::new(move |dom: &mut dyn ExplainedStore| {
            let cause = match dom.failure() {
                Inconsistency::Propagator(c) => Cause::Propagator(c),
                _ => unreachable!(),
            };
            dom.remove_value(x, 5, &cause)?;
            Ok(())
        }));
        cp.schedule(c);
        assert_eq!(Ok(()), cp.fixpoint());

        let ded = cp.explanations_mut().removal_of(x, 5);
        let stored = cp.explanations().retrieve(ded).unwrap();
        // the default why() yields no premise, only the activation
        assert_eq!(0, stored.nb_deductions());
        assert!(stored.causes().any(|cc| cc == c));
    }
}
