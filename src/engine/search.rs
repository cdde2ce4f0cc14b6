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

//! This module implements the search itself: a depth first exploration with
//! conflict directed backjumping. Each branching decision opens one world;
//! when a dead end is analyzed, the search jumps straight back to the deepest
//! world the conflict actually depends on, refutes its decision, and replays
//! the negation justified by the conflict.

use crate::{
    objective_manager, post_cut, Cause, ConstraintStore, CpModelImpl, Decision, DecisionOperator,
    DomainInspect, IncoherentState, Inconsistency, ObjectiveManager, ObjectivePolicy,
    SaveAndRestore, StateManager, TrailedStateManager, Variable,
};

/// How the next branching variable is picked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableHeuristic {
    /// The first unfixed variable, in the order they were handed to the solver
    InputOrder,
    /// The unfixed variable with the smallest domain
    FirstFail,
}

/// The tunable knobs of the search
#[derive(Debug, Clone, Copy)]
pub struct SearchConfig {
    /// how the next branching variable is picked (branching always tries the
    /// minimum value of its domain first)
    pub variable_heuristic: VariableHeuristic,
}
impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            variable_heuristic: VariableHeuristic::InputOrder,
        }
    }
}

/// One complete assignment of the branching variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Solution {
    assignments: Vec<(Variable, isize)>,
    objective: Option<isize>,
}
impl Solution {
    /// The value of the given variable in this solution (if it was one of
    /// the branching variables)
    pub fn value_of(&self, var: Variable) -> Option<isize> {
        self.assignments
            .iter()
            .find(|(v, _)| *v == var)
            .map(|(_, value)| *value)
    }
    /// The objective value of this solution (if the search optimizes one)
    pub fn objective(&self) -> Option<isize> {
        self.objective
    }
}

/// This is the type of solver you will likely want to work with
pub type DefaultSolver = Solver<TrailedStateManager>;

/// The solver drives the exploration of one model. Several solvers working
/// on copies of the same model may share one objective manager, in which
/// case each of them prunes with the best bound any of them witnessed.
pub struct Solver<T: StateManager> {
    /// the model being solved
    model: CpModelImpl<T>,
    /// the variables the search branches on
    branch_vars: Vec<Variable>,
    /// the knobs
    config: SearchConfig,
    /// the current branch: the decision at index i lives in world i + 1
    decisions: Vec<Decision>,
    /// the shared objective record and the cut enforcing it (if any)
    objective: Option<(ObjectiveManager, crate::Constraint)>,
    /// the best solution this solver witnessed
    best_solution: Option<Solution>,
    /// how many solutions this solver witnessed
    n_solutions: usize,
    /// the search stops as soon as any of these returns true
    stop_criteria: Vec<Box<dyn Fn() -> bool + Send>>,
    /// called on every solution
    solution_hooks: Vec<Box<dyn FnMut(&Solution) + Send>>,
    /// called once when the search ends (exhaustion or stop criterion)
    close_hooks: Vec<Box<dyn FnMut() + Send>>,
}

impl<T: StateManager> Solver<T> {
    /// Creates a solver exploring the given model by branching on the given
    /// variables
    pub fn new(model: CpModelImpl<T>, branch_vars: Vec<Variable>) -> Self {
        Self::with_config(model, branch_vars, SearchConfig::default())
    }
    /// Creates a solver with non default search knobs
    pub fn with_config(
        model: CpModelImpl<T>,
        branch_vars: Vec<Variable>,
        config: SearchConfig,
    ) -> Self {
        Self {
            model,
            branch_vars,
            config,
            decisions: vec![],
            objective: None,
            best_solution: None,
            n_solutions: 0,
            stop_criteria: vec![],
            solution_hooks: vec![],
            close_hooks: vec![],
        }
    }

    /// Turns the search into a minimization of the given variable and
    /// returns the shared objective record
    pub fn minimize(&mut self, variable: Variable) -> ObjectiveManager {
        let manager = objective_manager(ObjectivePolicy::Minimize, variable);
        self.share_objective(manager.clone());
        manager
    }
    /// Turns the search into a maximization of the given variable and
    /// returns the shared objective record
    pub fn maximize(&mut self, variable: Variable) -> ObjectiveManager {
        let manager = objective_manager(ObjectivePolicy::Maximize, variable);
        self.share_objective(manager.clone());
        manager
    }
    /// Makes this solver prune with (and publish to) the given objective
    /// record. This is how portfolio instances share their bounds. The
    /// objective variable should end up fixed in every solution (branch on
    /// it, or constrain it so propagation fixes it): the value of an unfixed
    /// objective is never published.
    pub fn share_objective(&mut self, manager: ObjectiveManager) {
        let cut = post_cut(&mut self.model, manager.clone());
        self.objective = Some((manager, cut));
    }
    /// The shared objective record of this solver (if it optimizes)
    pub fn objective_manager(&self) -> Option<&ObjectiveManager> {
        self.objective.as_ref().map(|(manager, _)| manager)
    }

    /// The search stops as soon as the given criterion returns true
    pub fn add_stop_criterion(&mut self, criterion: Box<dyn Fn() -> bool + Send>) {
        self.stop_criteria.push(criterion);
    }
    /// Registers a callback invoked on every solution
    pub fn on_solution(&mut self, hook: Box<dyn FnMut(&Solution) + Send>) {
        self.solution_hooks.push(hook);
    }
    /// Registers a callback invoked once when the search ends
    pub fn on_close(&mut self, hook: Box<dyn FnMut() + Send>) {
        self.close_hooks.push(hook);
    }

    /// The best solution this solver witnessed so far
    pub fn best_solution(&self) -> Option<&Solution> {
        self.best_solution.as_ref()
    }
    /// How many solutions this solver witnessed so far
    pub fn n_solutions(&self) -> usize {
        self.n_solutions
    }

    /// Searches for one solution. `Ok(None)` means the problem is infeasible
    /// (or a stop criterion fired before any solution was found).
    pub fn find_solution(&mut self) -> Result<Option<Solution>, IncoherentState> {
        self.solve(true)
    }
    /// Exhausts the search space (or runs until a stop criterion fires) and
    /// returns the best solution witnessed
    pub fn find_optimal_solution(&mut self) -> Result<Option<Solution>, IncoherentState> {
        let result = self.solve(false);
        self.model.restore_until(0);
        self.decisions.clear();
        result
    }

    //~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
    //~~~~ THE EXPLORATION ITSELF ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
    //~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~

    fn solve(&mut self, stop_at_first: bool) -> Result<Option<Solution>, IncoherentState> {
        self.schedule_cut();
        if let Err(failure) = self.model.fixpoint() {
            if !self.backtrack(failure)? {
                self.close();
                return Ok(None);
            }
        }

        let mut found = None;
        loop {
            if self.must_stop() {
                break;
            }
            match self.next_decision() {
                Some(decision) => {
                    self.model.save_state();
                    let world = self.decisions.len() + 1;
                    self.decisions.push(decision);

                    let mut outcome =
                        decision.apply(&mut self.model, &Cause::Branch(world)).map(|_| ());
                    if outcome.is_ok() {
                        self.schedule_cut();
                        outcome = self.model.fixpoint();
                    }
                    if let Err(failure) = outcome {
                        if !self.backtrack(failure)? {
                            break;
                        }
                    }
                }
                None => {
                    // every branching variable is fixed: this is a solution
                    let solution = self.notify_solution();
                    found = Some(solution);
                    if stop_at_first {
                        break;
                    }
                    if !self.flip_latest()? {
                        break;
                    }
                }
            }
        }

        self.close();
        if stop_at_first {
            Ok(found)
        } else {
            Ok(self.best_solution.clone())
        }
    }

    /// Analyzes a dead end and jumps back to the deepest world the conflict
    /// depends on. Returns false when the search space is exhausted.
    fn backtrack(&mut self, failure: Inconsistency) -> Result<bool, IncoherentState> {
        let mut failure = failure;
        loop {
            let conflict = match self.model.analyze(failure, &self.decisions)? {
                None => return Ok(false),
                Some(conflict) => conflict,
            };
            log::debug!(
                "jumping from world {} back to world {}",
                self.decisions.len(),
                conflict.world
            );

            let target = conflict.world;
            let mut decision = self.decisions[target - 1];
            self.model.restore_until(target - 1);
            self.decisions.truncate(target - 1);

            decision.refuted = true;
            self.model.save_state();
            self.decisions.push(decision);

            // the negation of a refuted decision is a *derived* fact: its
            // justification is the conflict that refuted it. The chronological
            // fallback carries no justification and replays as a plain branch.
            let cause = match conflict.refutation {
                Some(refutation) => Cause::Justified(refutation),
                None => Cause::Branch(target),
            };
            let mut outcome = decision.unapply(&mut self.model, &cause).map(|_| ());
            if outcome.is_ok() {
                self.schedule_cut();
                outcome = self.model.fixpoint();
            }
            match outcome {
                Ok(()) => return Ok(true),
                Err(f) => failure = f,
            }
        }
    }

    /// After a solution: chronologically refutes the deepest decision that
    /// still has an unexplored branch. Returns false when there is none left.
    fn flip_latest(&mut self) -> Result<bool, IncoherentState> {
        match self.decisions.iter().rposition(|d| !d.refuted) {
            None => Ok(false),
            Some(i) => {
                let mut decision = self.decisions[i];
                self.model.restore_until(i);
                self.decisions.truncate(i);

                decision.refuted = true;
                self.model.save_state();
                self.decisions.push(decision);

                let mut outcome = decision
                    .unapply(&mut self.model, &Cause::Branch(i + 1))
                    .map(|_| ());
                if outcome.is_ok() {
                    self.schedule_cut();
                    outcome = self.model.fixpoint();
                }
                match outcome {
                    Ok(()) => Ok(true),
                    Err(failure) => self.backtrack(failure),
                }
            }
        }
    }

    /// Picks the next branching decision (or None when all the branching
    /// variables are fixed)
    fn next_decision(&self) -> Option<Decision> {
        let unfixed = self
            .branch_vars
            .iter()
            .copied()
            .filter(|v| !self.model.is_fixed(*v));
        let var = match self.config.variable_heuristic {
            VariableHeuristic::InputOrder => unfixed.into_iter().next(),
            VariableHeuristic::FirstFail => unfixed.min_by_key(|v| self.model.size(*v)),
        }?;
        let value = self.model.min(var)?;
        Some(Decision::on_int(DecisionOperator::Eq, var, value))
    }

    /// Records a solution, publishes its objective value, and fires the
    /// solution hooks
    fn notify_solution(&mut self) -> Solution {
        let mut assignments = vec![];
        for var in self.branch_vars.iter().copied() {
            if let Some(value) = self.model.min(var) {
                assignments.push((var, value));
            }
        }
        let objective_value = self.objective.as_ref().and_then(|(manager, _)| {
            let objective = manager.lock();
            // an unfixed objective has no achieved value to publish: doing so
            // would tighten the shared cut beyond what this solution reaches
            if !self.model.is_fixed(objective.variable) {
                return None;
            }
            match objective.policy {
                ObjectivePolicy::Minimize => self.model.min(objective.variable),
                ObjectivePolicy::Maximize => self.model.max(objective.variable),
            }
        });
        let solution = Solution {
            assignments,
            objective: objective_value,
        };

        self.n_solutions += 1;
        let keep = match (&self.objective, objective_value) {
            (Some((manager, _)), Some(value)) => manager.lock().update_best(value),
            (Some(_), None) => false,
            (None, _) => true,
        };
        if keep {
            self.best_solution = Some(solution.clone());
        }
        for hook in self.solution_hooks.iter_mut() {
            hook(&solution);
        }
        solution
    }

    fn schedule_cut(&mut self) {
        if let Some((_, cut)) = &self.objective {
            self.model.schedule(*cut);
        }
    }
    fn must_stop(&self) -> bool {
        self.stop_criteria.iter().any(|criterion| criterion())
    }
    fn close(&mut self) {
        for hook in self.close_hooks.iter_mut() {
            hook();
        }
    }
}

// #############################################################################
// ### UNIT TESTS ##############################################################
// #############################################################################

#[cfg(test)]
mod test_search {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crate::*;

    /// A difference constraint with honest justifications: a pruning on one
    /// side is explained by whatever fixed the other side.
    struct NotEqual {
        x: Variable,
        y: Variable,
    }
    impl Propagator for NotEqual {
        fn propagate(&mut self, store: &mut dyn ExplainedStore) -> CPResult<()> {
            let cause = match store.failure() {
                Inconsistency::Propagator(c) => Cause::Propagator(c),
                failure => return Err(failure),
            };
            if store.is_fixed(self.x) {
                if let Some(v) = store.min(self.x) {
                    store.remove_value(self.y, v, &cause)?;
                }
            }
            if store.is_fixed(self.y) {
                if let Some(v) = store.min(self.y) {
                    store.remove_value(self.x, v, &cause)?;
                }
            }
            Ok(())
        }
        fn why(
            &self,
            deduction: Deduction,
            domains: &dyn DomainInspect,
            explanations: &ExplanationEngine,
            explanation: &mut Explanation,
        ) {
            let other = match deduction.target {
                TargetVar::Int(v) if v == self.x => self.y,
                TargetVar::Int(_) => self.x,
                TargetVar::Set(_) => return,
            };
            explanation.merge(&explanations.explain_domain(domains, other));
        }
    }

    fn post_not_equal(cp: &mut DefaultCpModel, x: Variable, y: Variable) {
        let c = cp.post(Box::new(NotEqual { x, y }));
        cp.propagate_on(c, DomainCondition::IsFixed(x));
        cp.propagate_on(c, DomainCondition::IsFixed(y));
    }

    #[test]
    fn find_solution_on_an_unconstrained_model_picks_the_minima() {
        let mut cp = DefaultCpModel::default();
        let x = cp.new_int_var(3, 7);
        let y = cp.new_int_var(0, 2);

        let mut solver = DefaultSolver::new(cp, vec![x, y]);
        let solution = solver.find_solution().unwrap().unwrap();
        assert_eq!(Some(3), solution.value_of(x));
        assert_eq!(Some(0), solution.value_of(y));
    }

    #[test]
    fn find_solution_respects_the_constraints() {
        let mut cp = DefaultCpModel::default();
        let x = cp.new_int_var(0, 2);
        let y = cp.new_int_var(0, 2);
        let z = cp.new_int_var(0, 2);
        post_not_equal(&mut cp, x, y);
        post_not_equal(&mut cp, x, z);
        post_not_equal(&mut cp, y, z);

        let mut solver = DefaultSolver::new(cp, vec![x, y, z]);
        let solution = solver.find_solution().unwrap().unwrap();

        let vx = solution.value_of(x).unwrap();
        let vy = solution.value_of(y).unwrap();
        let vz = solution.value_of(z).unwrap();
        assert_ne!(vx, vy);
        assert_ne!(vx, vz);
        assert_ne!(vy, vz);
    }

    #[test]
    fn an_infeasible_model_yields_no_solution() {
        // three pairwise distinct variables over only two values
        let mut cp = DefaultCpModel::default();
        let x = cp.new_int_var(0, 1);
        let y = cp.new_int_var(0, 1);
        let z = cp.new_int_var(0, 1);
        post_not_equal(&mut cp, x, y);
        post_not_equal(&mut cp, x, z);
        post_not_equal(&mut cp, y, z);

        let mut solver = DefaultSolver::new(cp, vec![x, y, z]);
        assert_eq!(Ok(None), solver.find_solution());
    }

    #[test]
    fn exhaustive_search_enumerates_every_assignment() {
        let mut cp = DefaultCpModel::default();
        let x = cp.new_bool_var();
        let y = cp.new_bool_var();
        let z = cp.new_bool_var();

        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);

        let mut solver = DefaultSolver::new(cp, vec![x, y, z]);
        solver.on_solution(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(solver.find_optimal_solution().unwrap().is_some());
        assert_eq!(8, count.load(Ordering::SeqCst));
        assert_eq!(8, solver.n_solutions());
    }

    #[test]
    fn exhaustive_search_enumerates_every_permutation() {
        let mut cp = DefaultCpModel::default();
        let x = cp.new_int_var(0, 2);
        let y = cp.new_int_var(0, 2);
        let z = cp.new_int_var(0, 2);
        post_not_equal(&mut cp, x, y);
        post_not_equal(&mut cp, x, z);
        post_not_equal(&mut cp, y, z);

        let mut solver = DefaultSolver::new(cp, vec![x, y, z]);
        assert!(solver.find_optimal_solution().unwrap().is_some());
        assert_eq!(6, solver.n_solutions());
    }

    #[test]
    fn minimization_finds_the_least_value() {
        let mut cp = DefaultCpModel::default();
        let x = cp.new_int_var(3, 9);

        let mut solver = DefaultSolver::new(cp, vec![x]);
        solver.minimize(x);

        let best = solver.find_optimal_solution().unwrap().unwrap();
        assert_eq!(Some(3), best.objective());
        assert_eq!(Some(3), best.value_of(x));
    }

    #[test]
    fn maximization_climbs_to_the_greatest_value() {
        let mut cp = DefaultCpModel::default();
        let x = cp.new_int_var(3, 9);

        let mut solver = DefaultSolver::new(cp, vec![x]);
        solver.maximize(x);

        let best = solver.find_optimal_solution().unwrap().unwrap();
        assert_eq!(Some(9), best.objective());
    }

    #[test]
    fn optimization_with_constraints_finds_the_optimum() {
        let mut cp = DefaultCpModel::default();
        let x = cp.new_int_var(0, 3);
        let y = cp.new_int_var(0, 3);
        post_not_equal(&mut cp, x, y);

        // maximize y while y != x and x is forced low by branching order
        let mut solver = DefaultSolver::new(cp, vec![x, y]);
        solver.maximize(y);

        let best = solver.find_optimal_solution().unwrap().unwrap();
        assert_eq!(Some(3), best.objective());
    }

    #[test]
    fn an_unfixed_objective_publishes_no_bound() {
        let mut cp = DefaultCpModel::default();
        let x = cp.new_int_var(0, 1);
        let y = cp.new_int_var(0, 5);

        // y is the objective but nothing ever fixes it
        let mut solver = DefaultSolver::new(cp, vec![x]);
        let manager = solver.maximize(y);

        let solution = solver.find_solution().unwrap().unwrap();
        assert_eq!(None, solution.objective());
        assert_eq!(None, manager.lock().best());
    }

    #[test]
    fn a_stop_criterion_interrupts_the_search_and_the_close_hook_fires() {
        let mut cp = DefaultCpModel::default();
        let x = cp.new_int_var(0, 9);

        let closed = Arc::new(AtomicUsize::new(0));
        let witness = Arc::clone(&closed);

        let mut solver = DefaultSolver::new(cp, vec![x]);
        solver.add_stop_criterion(Box::new(|| true));
        solver.on_close(Box::new(move || {
            witness.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(Ok(None), solver.find_solution());
        assert_eq!(1, closed.load(Ordering::SeqCst));
    }

    #[test]
    fn first_fail_branches_on_the_tightest_domain_first() {
        let mut cp = DefaultCpModel::default();
        let x = cp.new_int_var(0, 9);
        let y = cp.new_int_var(5, 6);

        let config = SearchConfig {
            variable_heuristic: VariableHeuristic::FirstFail,
        };
        let mut solver = DefaultSolver::with_config(cp, vec![x, y], config);
        let solution = solver.find_solution().unwrap().unwrap();
        // both get their minimum either way; this checks the search completes
        assert_eq!(Some(0), solution.value_of(x));
        assert_eq!(Some(5), solution.value_of(y));
    }
}
