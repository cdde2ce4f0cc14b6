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

//! This module implements the explanation engine: the entity that remembers
//! *why* every value ever left a domain. Each elimination is materialized as
//! a `Deduction` (an interned fact), and the engine maintains a causal
//! database mapping each derived deduction onto the `Explanation` that
//! produced it. When a dead end is reached, flattening an explanation down
//! to the branching facts it transitively depends on tells the search which
//! worlds are actually responsible for the failure, and hence how far it can
//! jump back in one go.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{Constraint, Decision, DomainInspect, SetVariable, TargetVar, Variable};

/// This error signals a defect of the engine itself: a fact that should have
/// been recorded cannot be found. It is unrecoverable but it is reported as
/// a value so that the embedding application decides what to do with it
/// (the original recorder killed the whole process instead).
#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
#[error("incoherent explanation state: a fact was never recorded")]
pub struct IncoherentState;

/// The two kinds of facts the engine reasons about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeductionKind {
    /// A value has been eliminated from a domain (for a set variable: the
    /// value has been excluded from the envelope)
    Removal,
    /// A variable has been assigned a value (for a set variable: the value
    /// has been forced into the kernel)
    Assignment,
}

/// An elementary fact about the state of the domains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Deduction {
    /// the variable the fact is about
    pub target: TargetVar,
    /// the value the fact is about
    pub value: isize,
    /// what the fact states about (target, value)
    pub kind: DeductionKind,
}

/// The canonical identifier of an interned deduction. Asking the engine
/// twice for the same (target, value, kind) yields the same identifier, so
/// identifier equality is fact identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeductionId(usize);

/// An explanation is an unordered collection of deductions and of propagator
/// activations. It captures the premises under which some fact was derived.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Explanation {
    deductions: FxHashSet<DeductionId>,
    causes: FxHashSet<Constraint>,
}
impl Explanation {
    /// Creates an empty explanation
    pub fn new() -> Self {
        Self::default()
    }
    /// Adds a deduction to the premises
    pub fn add(&mut self, deduction: DeductionId) {
        self.deductions.insert(deduction);
    }
    /// Removes a deduction from the premises
    pub fn remove(&mut self, deduction: DeductionId) {
        self.deductions.remove(&deduction);
    }
    /// Adds a propagator activation to the premises
    pub fn add_cause(&mut self, cause: Constraint) {
        self.causes.insert(cause);
    }
    /// Merges all the premises of the other explanation into this one
    pub fn merge(&mut self, other: &Explanation) {
        self.deductions.extend(other.deductions.iter().copied());
        self.causes.extend(other.causes.iter().copied());
    }
    /// Returns true iff the given deduction belongs to the premises
    pub fn contains(&self, deduction: DeductionId) -> bool {
        self.deductions.contains(&deduction)
    }
    /// Iterates over the deductions of this explanation
    pub fn deductions(&self) -> impl Iterator<Item = DeductionId> + '_ {
        self.deductions.iter().copied()
    }
    /// Iterates over the propagator activations of this explanation
    pub fn causes(&self) -> impl Iterator<Item = Constraint> + '_ {
        self.causes.iter().copied()
    }
    /// Returns the number of deductions among the premises
    pub fn nb_deductions(&self) -> usize {
        self.deductions.len()
    }
    /// Returns true iff the explanation has no premise at all
    pub fn is_empty(&self) -> bool {
        self.deductions.is_empty() && self.causes.is_empty()
    }
}

/// The agent performing an explained mutation. It determines how the
/// deductions produced by the mutation are justified.
#[derive(Debug, Clone)]
pub enum Cause {
    /// The mutation is the application of the decision opening the given
    /// world: its deductions are terminal branch facts tagged with that
    /// world index
    Branch(usize),
    /// The mutation replays a refuted decision: its deductions are all
    /// justified by the given (already flattened) explanation
    Justified(Explanation),
    /// The mutation is a pruning of the given propagator: its deductions
    /// are justified by asking the propagator itself, once its propagation
    /// step has returned
    Propagator(Constraint),
}

/// The outcome of a successful conflict analysis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// The world whose decision must be refuted
    pub world: usize,
    /// The justification of the refutation: the flattened conflict minus the
    /// facts of the refuted world. `None` when the analysis had to fall back
    /// to a chronological flip (the incriminated decision had already been
    /// refuted), in which case the replay is a plain branch.
    pub refutation: Option<Explanation>,
}

/// A monitor gets notified of everything the engine records. It must never
/// influence the search; the stock implementation simply traces.
pub trait ExplanationMonitor {
    /// One deduction has just been recorded
    fn on_record(&mut self, _deduction: Deduction, _cause: &Cause) {}
    /// A conflict has just been analyzed
    fn on_conflict(&mut self, _conflict: &Conflict) {}
}

/// The stock monitor: it forwards everything onto the log facade
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceMonitor;
impl ExplanationMonitor for TraceMonitor {
    fn on_record(&mut self, deduction: Deduction, cause: &Cause) {
        log::debug!("recorded {:?} because of {:?}", deduction, cause);
    }
    fn on_conflict(&mut self, conflict: &Conflict) {
        log::debug!("conflict sends the search back to world {}", conflict.world);
    }
}

/// The explanation engine: interns deductions, maintains the causal
/// database, and analyzes conflicts
pub struct ExplanationEngine {
    /// the canonicalization table
    interned: FxHashMap<Deduction, DeductionId>,
    /// the facts, indexed by their identifier
    facts: Vec<Deduction>,
    /// the causal database: each *derived* fact maps onto its explanation
    database: FxHashMap<DeductionId, Explanation>,
    /// the world in which each *branch* fact was produced
    branch_worlds: FxHashMap<DeductionId, usize>,
    /// all the removals ever recorded, per integer variable
    removals: FxHashMap<Variable, FxHashMap<isize, DeductionId>>,
    /// all the facts ever recorded, per set variable
    set_facts: FxHashMap<SetVariable, Vec<DeductionId>>,
    /// the prunings whose justification is still owed by their propagator
    pending: Vec<(Constraint, DeductionId)>,
    /// the observers
    monitors: Vec<Box<dyn ExplanationMonitor + Send>>,
}
impl Default for ExplanationEngine {
    fn default() -> Self {
        Self::new()
    }
}
impl ExplanationEngine {
    /// Creates a new engine with the stock tracing monitor installed
    pub fn new() -> Self {
        Self {
            interned: Default::default(),
            facts: vec![],
            database: Default::default(),
            branch_worlds: Default::default(),
            removals: Default::default(),
            set_facts: Default::default(),
            pending: vec![],
            monitors: vec![Box::new(TraceMonitor)],
        }
    }
    /// Installs an additional monitor
    pub fn add_monitor(&mut self, monitor: Box<dyn ExplanationMonitor + Send>) {
        self.monitors.push(monitor);
    }

    //~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
    //~~~~ INTERNING ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
    //~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~

    /// Returns the canonical identifier of the given fact, creating it if it
    /// was never seen before
    pub fn intern(&mut self, deduction: Deduction) -> DeductionId {
        if let Some(id) = self.interned.get(&deduction) {
            *id
        } else {
            let id = DeductionId(self.facts.len());
            self.facts.push(deduction);
            self.interned.insert(deduction, id);
            id
        }
    }
    /// Returns the fact behind the given identifier
    pub fn deduction(&self, id: DeductionId) -> Deduction {
        self.facts[id.0]
    }
    /// Looks a fact up without interning it: `None` means the fact was never
    /// recorded, hence cannot be cited as a premise
    pub fn find(&self, deduction: Deduction) -> Option<DeductionId> {
        self.interned.get(&deduction).copied()
    }
    /// The canonical fact stating that `value` left the domain of `var`
    pub fn removal_of(&mut self, var: Variable, value: isize) -> DeductionId {
        let id = self.intern(Deduction {
            target: TargetVar::Int(var),
            value,
            kind: DeductionKind::Removal,
        });
        self.removals.entry(var).or_default().insert(value, id);
        id
    }
    /// The canonical fact stating that `var` was assigned `value`
    pub fn assignment_of(&mut self, var: Variable, value: isize) -> DeductionId {
        self.intern(Deduction {
            target: TargetVar::Int(var),
            value,
            kind: DeductionKind::Assignment,
        })
    }
    /// The canonical fact stating that `value` was excluded from the
    /// envelope of the set variable `var`
    pub fn set_removal_of(&mut self, var: SetVariable, value: isize) -> DeductionId {
        let id = self.intern(Deduction {
            target: TargetVar::Set(var),
            value,
            kind: DeductionKind::Removal,
        });
        self.set_facts.entry(var).or_default().push(id);
        id
    }
    /// The canonical fact stating that `value` was forced into the kernel of
    /// the set variable `var`
    pub fn set_assignment_of(&mut self, var: SetVariable, value: isize) -> DeductionId {
        let id = self.intern(Deduction {
            target: TargetVar::Set(var),
            value,
            kind: DeductionKind::Assignment,
        });
        self.set_facts.entry(var).or_default().push(id);
        id
    }

    //~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
    //~~~~ RECORDING ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
    //~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~

    /// Records the given fact under the given cause. This is called by the
    /// explained mutation layer, right *before* the domain is touched.
    pub fn record(&mut self, id: DeductionId, cause: &Cause) {
        match cause {
            Cause::Branch(world) => {
                self.branch_worlds.insert(id, *world);
            }
            Cause::Justified(explanation) => {
                self.database.insert(id, explanation.clone());
            }
            Cause::Propagator(constraint) => {
                self.pending.push((*constraint, id));
            }
        }
        let fact = self.facts[id.0];
        for m in self.monitors.iter_mut() {
            m.on_record(fact, cause);
        }
    }
    /// Stores the given explanation in the causal database (overwriting any
    /// previous justification of the same fact)
    pub fn store(&mut self, id: DeductionId, explanation: Explanation) {
        self.database.insert(id, explanation);
    }
    /// Returns the stored explanation of a derived fact, if there is one
    /// (branch facts are terminal and have none)
    pub fn retrieve(&self, id: DeductionId) -> Option<&Explanation> {
        self.database.get(&id)
    }
    /// Returns the world in which the given branch fact was produced
    pub fn world_number(&self, id: DeductionId) -> Result<usize, IncoherentState> {
        self.branch_worlds.get(&id).copied().ok_or(IncoherentState)
    }
    /// Pops one pruning whose justification is still owed
    pub(crate) fn pop_pending(&mut self) -> Option<(Constraint, DeductionId)> {
        self.pending.pop()
    }
    /// Drops all owed justifications (stale after a state restoration)
    pub(crate) fn clear_pending(&mut self) {
        self.pending.clear();
    }

    //~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
    //~~~~ EXPLAINING ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
    //~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~

    /// Computes the transitive closure of the given explanation: every
    /// deduction that has an entry in the causal database is replaced by its
    /// own premises, until only terminal (branch) facts remain. Duplicate
    /// protection makes this terminate even when the database contains a
    /// cycle.
    pub fn flatten(&self, explanation: &Explanation) -> Explanation {
        let mut result = Explanation::new();
        let mut expanded = FxHashSet::default();
        let mut to_expand: Vec<DeductionId> = explanation.deductions().collect();
        for c in explanation.causes() {
            result.add_cause(c);
        }

        while let Some(ded) = to_expand.pop() {
            if !expanded.insert(ded) {
                continue;
            }
            if let Some(premises) = self.database.get(&ded) {
                to_expand.extend(premises.deductions());
                for c in premises.causes() {
                    result.add_cause(c);
                }
            } else {
                result.add(ded);
            }
        }
        result
    }

    /// The justification of a wiped out integer domain: every removal that
    /// is still effective for that variable
    pub fn explain_domain(&self, domains: &dyn DomainInspect, var: Variable) -> Explanation {
        let mut result = Explanation::new();
        if let Some(recorded) = self.removals.get(&var) {
            for (value, ded) in recorded.iter() {
                if !domains.contains(var, *value) {
                    result.add(*ded);
                }
            }
        }
        result
    }
    /// The justification of a contradictory set variable: every recorded
    /// membership fact whose value is currently settled, that is in the
    /// kernel or out of the envelope. A value that a restore put back in
    /// limbo only carries facts of abandoned branches; citing those would
    /// implicate the wrong worlds. A failed mutation leaves its value out of
    /// the envelope (or in the kernel), so its own fact is always cited.
    pub fn explain_set_domain(
        &self,
        domains: &dyn DomainInspect,
        var: SetVariable,
    ) -> Explanation {
        let mut result = Explanation::new();
        if let Some(recorded) = self.set_facts.get(&var) {
            for ded in recorded.iter() {
                let value = self.deduction(*ded).value;
                let settled = domains.set_kernel_contains(var, value)
                    || !domains.set_envelope_contains(var, value);
                if settled {
                    result.add(*ded);
                }
            }
        }
        result
    }
    /// The bounds rule: adds to `explanation` every recorded removal that
    /// currently shapes the bounds of `var` (that is, the removals lying
    /// outside of its current [min, max] range). This is how propagators
    /// cite "the bounds of x" among their premises.
    pub fn add_bounds(
        &self,
        domains: &dyn DomainInspect,
        var: Variable,
        explanation: &mut Explanation,
    ) {
        let min = domains.min(var);
        let max = domains.max(var);
        if let Some(recorded) = self.removals.get(&var) {
            for (value, ded) in recorded.iter() {
                let outside = match (min, max) {
                    (Some(lo), Some(hi)) => *value < lo || *value > hi,
                    _ => true,
                };
                if outside {
                    explanation.add(*ded);
                }
            }
        }
    }

    //~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
    //~~~~ CONFLICT ANALYSIS ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
    //~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~

    /// Analyzes a dead end whose root explanation is given. The flattened
    /// conflict only contains branch facts; the deepest world among them is
    /// the one whose decision must be refuted. Returns `Ok(None)` when the
    /// conflict does not depend on any decision that could still be flipped,
    /// in which case the search space is exhausted.
    pub fn analyze(
        &mut self,
        root: Explanation,
        decisions: &[Decision],
    ) -> Result<Option<Conflict>, IncoherentState> {
        let flat = self.flatten(&root);

        let mut deepest = 0;
        for ded in flat.deductions() {
            let world = self.world_number(ded)?;
            // stale entries of abandoned branches are simply ignored
            if world <= decisions.len() && world > deepest {
                deepest = world;
            }
        }
        if deepest == 0 {
            return Ok(None);
        }

        let conflict = if !decisions[deepest - 1].refuted {
            // true backjump: the refutation of that decision is everything
            // the conflict stated about the shallower worlds
            let mut refutation = flat.clone();
            let dropped: Vec<DeductionId> = flat
                .deductions()
                .filter(|d| self.branch_worlds.get(d) == Some(&deepest))
                .collect();
            for d in dropped {
                refutation.remove(d);
            }
            Conflict {
                world: deepest,
                refutation: Some(refutation),
            }
        } else {
            // both branches of the incriminated decision have been explored
            // already: fall back to a chronological flip
            match decisions.iter().rposition(|d| !d.refuted) {
                None => return Ok(None),
                Some(i) => Conflict {
                    world: i + 1,
                    refutation: None,
                },
            }
        };

        for m in self.monitors.iter_mut() {
            m.on_conflict(&conflict);
        }
        Ok(Some(conflict))
    }
}

// #############################################################################
// ### UNIT TESTS ##############################################################
// #############################################################################

//~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
//~~~~ CANONICALIZATION ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
//~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
#[cfg(test)]
mod test_interning {
    use super::*;
    use crate::{DefaultDomainStore, DomainStore};

    #[test]
    fn asking_twice_for_the_same_fact_yields_the_same_identifier() {
        let mut ds = DefaultDomainStore::default();
        let x = ds.new_int_var(0, 5);
        let y = ds.new_int_var(0, 5);

        let mut engine = ExplanationEngine::new();
        let a = engine.removal_of(x, 3);
        let b = engine.removal_of(x, 3);
        let c = engine.removal_of(y, 3);
        let d = engine.removal_of(x, 4);
        let e = engine.assignment_of(x, 3);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_ne!(a, e);
    }

    #[test]
    fn assignment_and_removal_of_the_same_pair_are_distinct_facts() {
        let mut ds = DefaultDomainStore::default();
        let x = ds.new_int_var(0, 5);

        let mut engine = ExplanationEngine::new();
        let rem = engine.removal_of(x, 2);
        let asg = engine.assignment_of(x, 2);

        assert_eq!(DeductionKind::Removal, engine.deduction(rem).kind);
        assert_eq!(DeductionKind::Assignment, engine.deduction(asg).kind);
    }
}


//~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
//~~~~ WORLDS AND ANALYSIS ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
//~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
#[cfg(test)]
mod test_analysis {
    use super::*;
    use crate::{DecisionOperator, DefaultDomainStore, DomainStore};

    #[test]
    fn world_number_of_an_unrecorded_fact_is_an_incoherent_state() {
        let mut ds = DefaultDomainStore::default();
        let x = ds.new_int_var(0, 5);

        let mut engine = ExplanationEngine::new();
        let a = engine.removal_of(x, 0);
        assert_eq!(Err(IncoherentState), engine.world_number(a));

        engine.record(a, &Cause::Branch(3));
        assert_eq!(Ok(3), engine.world_number(a));
    }

    #[test]
    fn analysis_targets_the_deepest_implicated_world() {
        let mut ds = DefaultDomainStore::default();
        let x = ds.new_int_var(0, 9);

        let mut engine = ExplanationEngine::new();
        let d1 = engine.removal_of(x, 1);
        let d2 = engine.removal_of(x, 2);
        let d3 = engine.removal_of(x, 3);
        engine.record(d1, &Cause::Branch(1));
        engine.record(d2, &Cause::Branch(2));
        engine.record(d3, &Cause::Branch(3));

        let decisions = vec![
            Decision::on_int(DecisionOperator::Eq, x, 1),
            Decision::on_int(DecisionOperator::Eq, x, 2),
            Decision::on_int(DecisionOperator::Eq, x, 3),
        ];

        let mut root = Explanation::new();
        root.add(d1);
        root.add(d3);

        let conflict = engine.analyze(root, &decisions).unwrap().unwrap();
        assert_eq!(3, conflict.world);

        // the refutation keeps the shallower fact and drops the refuted one
        let refutation = conflict.refutation.unwrap();
        assert!(refutation.contains(d1));
        assert!(!refutation.contains(d3));
    }

    #[test]
    fn analysis_without_implicated_decision_reports_exhaustion() {
        let mut ds = DefaultDomainStore::default();
        let x = ds.new_int_var(0, 9);

        let mut engine = ExplanationEngine::new();
        let d0 = engine.removal_of(x, 0);
        engine.record(d0, &Cause::Branch(0));

        let decisions = vec![Decision::on_int(DecisionOperator::Eq, x, 1)];
        let mut root = Explanation::new();
        root.add(d0);

        assert_eq!(Ok(None), engine.analyze(root, &decisions));
    }

    #[test]
    fn analysis_falls_back_to_a_chronological_flip_for_a_refuted_decision() {
        let mut ds = DefaultDomainStore::default();
        let x = ds.new_int_var(0, 9);

        let mut engine = ExplanationEngine::new();
        let d2 = engine.removal_of(x, 2);
        engine.record(d2, &Cause::Branch(2));

        let mut refuted = Decision::on_int(DecisionOperator::Eq, x, 2);
        refuted.refuted = true;
        let decisions = vec![Decision::on_int(DecisionOperator::Eq, x, 1), refuted];

        let mut root = Explanation::new();
        root.add(d2);

        let conflict = engine.analyze(root, &decisions).unwrap().unwrap();
        assert_eq!(1, conflict.world);
        assert_eq!(None, conflict.refutation);
    }
}
