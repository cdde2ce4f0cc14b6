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

//! This module implements the parallel portfolio: several solver instances,
//! each with its own copy of the model (typically configured with different
//! search knobs), race on the same problem. The first instance to finish
//! makes every other one stop, and when the portfolio optimizes, each
//! solution found by one instance tightens the objective bound of all the
//! others.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{DefaultSolver, IncoherentState, ObjectiveManager, ObjectivePolicy, Solution};

/// The ways a portfolio run can fail
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum PortfolioError {
    /// racing a single instance is pointless
    #[error("a portfolio needs at least two solver instances")]
    NotEnoughSolvers,
    /// some instances optimize and some do not
    #[error("every instance of an optimizing portfolio must carry an objective")]
    MissingObjective,
    /// the instances do not optimize in the same direction
    #[error("all the instances of a portfolio must optimize in the same direction")]
    MismatchedObjectives,
    /// one of the instances detected a corrupted explanation state
    #[error("a solver instance reached an incoherent state: {0}")]
    Incoherent(#[from] IncoherentState),
}

/// The portfolio coordinator. It owns the solver instances and wires them
/// together: a shared finisher counter implements the stop criterion, and
/// (when optimizing) every solution is broadcast to the objective record of
/// every instance.
pub struct Portfolio {
    /// the racing instances
    solvers: Vec<DefaultSolver>,
    /// which instances already carry the cross-instance hooks (an instance
    /// is wired once, on its first run)
    wired: Vec<bool>,
    /// how many instances have finished the current run. It becomes nonzero
    /// as soon as one instance ends (which stops all the others) and the
    /// last instance to close resets it to zero so the portfolio can be run
    /// again.
    finishers: Arc<AtomicUsize>,
    /// how many instances take part in the current run. The close hooks read
    /// it through this shared cell so instances added between two runs are
    /// accounted for.
    population: Arc<AtomicUsize>,
    /// the objective records the solution hooks broadcast to, refreshed
    /// before every run
    managers: Arc<Mutex<Vec<ObjectiveManager>>>,
}

impl Portfolio {
    /// Creates a portfolio racing the given solver instances
    pub fn new(solvers: Vec<DefaultSolver>) -> Self {
        let wired = vec![false; solvers.len()];
        Self {
            solvers,
            wired,
            finishers: Arc::new(AtomicUsize::new(0)),
            population: Arc::new(AtomicUsize::new(0)),
            managers: Arc::new(Mutex::new(vec![])),
        }
    }
    /// Adds one more instance to the race
    pub fn add_solver(&mut self, solver: DefaultSolver) {
        self.solvers.push(solver);
        self.wired.push(false);
    }
    /// Removes (and returns) the instance at the given position
    pub fn remove_solver(&mut self, position: usize) -> DefaultSolver {
        self.wired.remove(position);
        self.solvers.remove(position)
    }
    /// How many instances the portfolio races
    pub fn len(&self) -> usize {
        self.solvers.len()
    }
    /// True iff the portfolio has no instance at all
    pub fn is_empty(&self) -> bool {
        self.solvers.is_empty()
    }
    /// A shared reference to the instance at the given position
    pub fn solver(&self, position: usize) -> Option<&DefaultSolver> {
        self.solvers.get(position)
    }
    /// Exclusive access to the instances, typically to tune them before a run
    pub fn solvers_mut(&mut self) -> &mut [DefaultSolver] {
        &mut self.solvers
    }

    /// Verifies that the portfolio is runnable: at least two instances, and
    /// either none of them optimizes or they all optimize in the same
    /// direction
    pub fn check(&self) -> Result<(), PortfolioError> {
        if self.solvers.len() < 2 {
            return Err(PortfolioError::NotEnoughSolvers);
        }
        let mut reference: Option<ObjectivePolicy> = None;
        let mut satisfaction = false;
        for solver in self.solvers.iter() {
            match solver.objective_manager() {
                None => satisfaction = true,
                Some(manager) => {
                    let policy = manager.lock().policy;
                    match reference {
                        None => reference = Some(policy),
                        Some(p) if p != policy => {
                            return Err(PortfolioError::MismatchedObjectives)
                        }
                        Some(_) => {}
                    }
                }
            }
        }
        if reference.is_some() && satisfaction {
            return Err(PortfolioError::MissingObjective);
        }
        Ok(())
    }

    /// Races the instances until one of them finds a solution (or proves
    /// there is none)
    pub fn find_solution(&mut self) -> Result<Option<Solution>, PortfolioError> {
        self.check()?;
        self.configure();
        self.run(true)
    }
    /// Races the instances until one of them exhausts its search space and
    /// returns the best solution found by any of them
    pub fn find_optimal_solution(&mut self) -> Result<Option<Solution>, PortfolioError> {
        self.check()?;
        self.configure();
        self.run(false)
    }

    /// The index of the winning instance of the latest run: the first one
    /// with solutions when satisfying, the one holding the strictly best
    /// objective value when optimizing (ties go to the earliest instance)
    pub fn finder(&self) -> Option<usize> {
        let policy = self
            .solvers
            .first()
            .and_then(|s| s.objective_manager())
            .map(|m| m.lock().policy);
        match policy {
            None => self.solvers.iter().position(|s| s.n_solutions() > 0),
            Some(policy) => {
                let mut best: Option<(usize, isize)> = None;
                for (i, solver) in self.solvers.iter().enumerate() {
                    let value = solver.best_solution().and_then(|s| s.objective());
                    if let Some(value) = value {
                        let improves = match (policy, best) {
                            (_, None) => true,
                            (ObjectivePolicy::Minimize, Some((_, b))) => value < b,
                            (ObjectivePolicy::Maximize, Some((_, b))) => value > b,
                        };
                        if improves {
                            best = Some((i, value));
                        }
                    }
                }
                best.map(|(i, _)| i)
            }
        }
    }

    //~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
    //~~~~ THE WIRING AND THE RACE ITSELF ~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~
    //~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~~

    /// Prepares a run: refreshes the shared population and broadcast list,
    /// then installs the cross-instance hooks on every instance that does
    /// not carry them yet (the finisher based stop criterion, the close hook
    /// maintaining the finisher counter, and the bound broadcasting solution
    /// hook). The hooks go through shared cells, so the ones installed on an
    /// earlier run keep working when instances are added in between.
    fn configure(&mut self) {
        self.population.store(self.solvers.len(), Ordering::SeqCst);
        {
            let mut managers = self.managers.lock();
            managers.clear();
            managers.extend(
                self.solvers
                    .iter()
                    .filter_map(|s| s.objective_manager().cloned()),
            );
        }

        for (solver, wired) in self.solvers.iter_mut().zip(self.wired.iter_mut()) {
            if *wired {
                continue;
            }
            *wired = true;

            let finishers = Arc::clone(&self.finishers);
            solver.add_stop_criterion(Box::new(move || {
                finishers.load(Ordering::SeqCst) > 0
            }));

            let finishers = Arc::clone(&self.finishers);
            let population = Arc::clone(&self.population);
            solver.on_close(Box::new(move || {
                let closed = finishers.fetch_add(1, Ordering::SeqCst) + 1;
                if closed == population.load(Ordering::SeqCst) {
                    finishers.store(0, Ordering::SeqCst);
                }
            }));

            let managers = Arc::clone(&self.managers);
            solver.on_solution(Box::new(move |solution| {
                if let Some(value) = solution.objective() {
                    // update_best is monotonic so a stale broadcast can
                    // never loosen anybody's bound
                    for manager in managers.lock().iter() {
                        manager.lock().update_best(value);
                    }
                }
            }));
        }
    }

    /// Runs every instance on its own thread and picks the winner
    fn run(&mut self, stop_at_first: bool) -> Result<Option<Solution>, PortfolioError> {
        let outcomes: Vec<Result<Option<Solution>, IncoherentState>> =
            std::thread::scope(|scope| {
                let handles: Vec<_> = self
                    .solvers
                    .iter_mut()
                    .map(|solver| {
                        scope.spawn(move || {
                            if stop_at_first {
                                solver.find_solution()
                            } else {
                                solver.find_optimal_solution()
                            }
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| handle.join().expect("a solver instance panicked"))
                    .collect()
            });

        let mut results = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            results.push(outcome?);
        }
        // the finder may have been stopped before re-reporting its solution
        // on a rerun, in which case any other reported solution will do
        let picked = self
            .finder()
            .and_then(|winner| results.get(winner).cloned().flatten())
            .or_else(|| results.iter().flatten().next().cloned());
        Ok(picked)
    }
}

// #############################################################################
// ### UNIT TESTS ##############################################################
// #############################################################################

#[cfg(test)]
mod test_portfolio {
    use std::sync::atomic::Ordering;

    use crate::*;

    fn distinct_instance() -> (DefaultSolver, Vec<Variable>) {
        let mut cp = DefaultCpModel::default();
        let vars: Vec<Variable> = (0..3).map(|_| cp.new_int_var(0, 2)).collect();
        cp.install(&AllDifferent::new(vars.clone()));
        (DefaultSolver::new(cp, vars.clone()), vars)
    }

    #[test]
    fn a_single_instance_is_rejected() {
        let (solver, _) = distinct_instance();
        let mut portfolio = Portfolio::new(vec![solver]);
        assert_eq!(
            Err(PortfolioError::NotEnoughSolvers),
            portfolio.find_solution()
        );
    }

    #[test]
    fn mixing_directions_is_rejected() {
        let (mut a, vars_a) = distinct_instance();
        let (mut b, vars_b) = distinct_instance();
        a.minimize(vars_a[0]);
        b.maximize(vars_b[0]);

        let mut portfolio = Portfolio::new(vec![a, b]);
        assert_eq!(
            Err(PortfolioError::MismatchedObjectives),
            portfolio.find_optimal_solution()
        );
    }

    #[test]
    fn a_missing_objective_is_rejected() {
        let (mut a, vars_a) = distinct_instance();
        let (b, _) = distinct_instance();
        a.minimize(vars_a[0]);

        let mut portfolio = Portfolio::new(vec![a, b]);
        assert_eq!(
            Err(PortfolioError::MissingObjective),
            portfolio.find_optimal_solution()
        );
    }

    #[test]
    fn the_race_terminates_and_resets_the_finisher_counter() {
        let (a, vars) = distinct_instance();
        let (b, _) = distinct_instance();
        let (c, _) = distinct_instance();
        let mut portfolio = Portfolio::new(vec![a, b, c]);

        let solution = portfolio.find_solution().unwrap().unwrap();
        let values: Vec<isize> = vars
            .iter()
            .map(|&v| solution.value_of(v).unwrap())
            .collect();
        assert!(values[0] != values[1] && values[0] != values[2] && values[1] != values[2]);

        // the last instance to close brought the counter back to zero so the
        // portfolio can be run again
        assert_eq!(0, portfolio.finishers.load(Ordering::SeqCst));
        assert!(portfolio.find_solution().unwrap().is_some());
        assert_eq!(0, portfolio.finishers.load(Ordering::SeqCst));
    }

    #[test]
    fn an_infeasible_race_reports_no_solution() {
        let infeasible = || {
            let mut cp = DefaultCpModel::default();
            let vars: Vec<Variable> = (0..4).map(|_| cp.new_int_var(1, 3)).collect();
            cp.install(&AllDifferent::new(vars.clone()));
            DefaultSolver::new(cp, vars)
        };
        let mut portfolio = Portfolio::new(vec![infeasible(), infeasible()]);
        assert_eq!(Ok(None), portfolio.find_solution());
    }

    #[test]
    fn instances_added_between_two_runs_are_wired_in() {
        let infeasible = || {
            let mut cp = DefaultCpModel::default();
            let vars: Vec<Variable> = (0..4).map(|_| cp.new_int_var(1, 3)).collect();
            cp.install(&AllDifferent::new(vars.clone()));
            DefaultSolver::new(cp, vars)
        };
        let mut portfolio = Portfolio::new(vec![infeasible(), infeasible()]);
        assert_eq!(Ok(None), portfolio.find_solution());
        assert_eq!(0, portfolio.finishers.load(Ordering::SeqCst));

        // the late instance must take part in the counter bookkeeping: were
        // it not wired, the two original closes would reset the counter and
        // its own close would leave it dangling at one
        portfolio.add_solver(infeasible());
        assert_eq!(3, portfolio.len());
        assert_eq!(Ok(None), portfolio.find_solution());
        assert_eq!(0, portfolio.finishers.load(Ordering::SeqCst));
    }

    #[test]
    fn an_optimizing_race_agrees_on_the_optimum() {
        let maximizing = |heuristic| {
            let mut cp = DefaultCpModel::default();
            let x = cp.new_int_var(0, 3);
            let y = cp.new_int_var(0, 3);
            cp.install(&AllDifferent::new(vec![x, y]));

            let config = SearchConfig {
                variable_heuristic: heuristic,
            };
            let mut solver = DefaultSolver::with_config(cp, vec![x, y], config);
            solver.maximize(y);
            solver
        };
        let mut portfolio = Portfolio::new(vec![
            maximizing(VariableHeuristic::InputOrder),
            maximizing(VariableHeuristic::FirstFail),
        ]);

        let best = portfolio.find_optimal_solution().unwrap().unwrap();
        assert_eq!(Some(3), best.objective());

        // the broadcast left every instance's record at the global optimum
        for solver in portfolio.solvers.iter() {
            let manager = solver.objective_manager().unwrap();
            assert_eq!(Some(3), manager.lock().best());
            // and the records stay monotonic: a stale value changes nothing
            assert!(!manager.lock().update_best(2));
        }
        assert!(portfolio.finder().is_some());
    }
}
