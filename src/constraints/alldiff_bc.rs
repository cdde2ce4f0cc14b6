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

//! This module provides the implementation of the bounds consistent alldiff
//! constraint. The filtering algorithm is the Hall interval based one
//! described in "A fast and simple algorithm for bounds consistency of the
//! alldifferent constraint", Lopez-Ortiz, Quimper, Tromp and van Beek,
//! IJCAI-03.

use crate::prelude::*;

/// This constraint enforces that the value affected to each variable be
/// different from the one affected to all other variables.
#[derive(Debug, Clone)]
pub struct AllDifferent {
    /// All these variables must take different values in the solution
    vars: Vec<Variable>,
}
impl AllDifferent {
    /// Creates an alldifferent modeling construct
    pub fn new(vars: Vec<Variable>) -> Self {
        Self { vars }
    }
}
impl ModelingConstruct for AllDifferent {
    fn install(&self, cp: &mut dyn ConstraintStore) {
        let propagator = AllDiffBounds::new(self.vars.clone());
        let constraint = cp.post(Box::new(propagator));
        for var in self.vars.iter().copied() {
            cp.propagate_on(constraint, DomainCondition::MinimumChanged(var));
            cp.propagate_on(constraint, DomainCondition::MaximumChanged(var));
            cp.propagate_on(constraint, DomainCondition::IsFixed(var));
        }
        cp.schedule(constraint);
    }
}

/// The bounds consistent alldiff propagator. The scratch arrays are the ones
/// of the original algorithm; they are allocated once and reused across the
/// propagation steps.
pub struct AllDiffBounds {
    vars: Vec<Variable>,

    /// variable indices, sorted by increasing lower bound
    minsorted: Vec<usize>,
    /// variable indices, sorted by increasing upper bound
    maxsorted: Vec<usize>,
    /// a snapshot of the lower bounds, taken at the start of each round
    lbs: Vec<isize>,
    /// a snapshot of the upper bounds, taken at the start of each round
    ubs: Vec<isize>,
    /// the sorted sequence of distinct interval endpoints (with sentinels)
    bounds: Vec<isize>,
    /// rank of each variable's lower bound in `bounds`
    minrank: Vec<usize>,
    /// rank of each variable's upper bound in `bounds`
    maxrank: Vec<usize>,
    /// the critical set tree
    t: Vec<usize>,
    /// the hall interval tree
    h: Vec<usize>,
    /// the interval capacities
    d: Vec<isize>,
    /// how many distinct endpoints the current round uses
    nb_bounds: usize,
}

impl AllDiffBounds {
    pub fn new(vars: Vec<Variable>) -> Self {
        let n = vars.len();
        Self {
            vars,
            minsorted: (0..n).collect(),
            maxsorted: (0..n).collect(),
            lbs: vec![0; n],
            ubs: vec![0; n],
            bounds: vec![0; 2 * n + 2],
            minrank: vec![0; n],
            maxrank: vec![0; n],
            t: vec![0; 2 * n + 2],
            h: vec![0; 2 * n + 2],
            d: vec![0; 2 * n + 2],
            nb_bounds: 0,
        }
    }

    /// Snapshots the current bounds of every variable
    fn snapshot(&mut self, store: &dyn ExplainedStore) -> CPResult<()> {
        for (i, var) in self.vars.iter().copied().enumerate() {
            self.lbs[i] = store.min(var).ok_or(Inconsistency::IntVariable(var))?;
            self.ubs[i] = store.max(var).ok_or(Inconsistency::IntVariable(var))?;
        }
        Ok(())
    }

    /// Sorts the variables by bounds and merges the endpoints into the
    /// `bounds` sequence, ranking every variable's endpoints in it
    fn sort_it(&mut self) {
        let Self {
            minsorted,
            maxsorted,
            lbs,
            ubs,
            bounds,
            minrank,
            maxrank,
            ..
        } = self;
        minsorted.sort_unstable_by_key(|&i| lbs[i]);
        maxsorted.sort_unstable_by_key(|&i| ubs[i]);

        let n = lbs.len();
        let mut min = lbs[minsorted[0]];
        let mut max = ubs[maxsorted[0]] + 1;
        let mut last = min - 2;
        let mut nb = 0;
        bounds[0] = last;

        let mut i = 0;
        let mut j = 0;
        loop {
            if i < n && min <= max {
                if min != last {
                    nb += 1;
                    last = min;
                    bounds[nb] = min;
                }
                minrank[minsorted[i]] = nb;
                i += 1;
                if i < n {
                    min = lbs[minsorted[i]];
                }
            } else {
                if max != last {
                    nb += 1;
                    last = max;
                    bounds[nb] = max;
                }
                maxrank[maxsorted[j]] = nb;
                j += 1;
                if j == n {
                    break;
                }
                max = ubs[maxsorted[j]] + 1;
            }
        }
        self.nb_bounds = nb;
        self.bounds[nb + 1] = self.bounds[nb] + 2;
    }

    /// Adjusts the lower bounds. Processes the variables by increasing upper
    /// bound, shrinking the capacity of the intervals they fall into; an
    /// interval whose capacity is exhausted is a Hall interval and every
    /// lower bound inside it is pushed past its end.
    fn filter_lower(
        &mut self,
        store: &mut dyn ExplainedStore,
        cause: &Cause,
    ) -> CPResult<bool> {
        let nb = self.nb_bounds;
        self.t[0] = 0;
        self.h[0] = 0;
        self.d[0] = 0;
        for i in 1..=nb + 1 {
            self.t[i] = i - 1;
            self.h[i] = i - 1;
            self.d[i] = self.bounds[i] - self.bounds[i - 1];
        }

        let mut changed = false;
        for i in 0..self.vars.len() {
            let vi = self.maxsorted[i];
            let x = self.minrank[vi];
            let y = self.maxrank[vi];
            let mut z = pathmax(&self.t, x + 1);
            let j = self.t[z];

            self.d[z] -= 1;
            if self.d[z] == 0 {
                self.t[z] = z + 1;
                z = pathmax(&self.t, self.t[z]);
                self.t[z] = j;
            }
            pathset(&mut self.t, x + 1, z, z);

            if self.d[z] < self.bounds[z] - self.bounds[y] {
                return Err(store.failure());
            }
            if self.h[x] > x {
                let w = pathmax(&self.h, self.h[x]);
                changed |= store.update_lower_bound(self.vars[vi], self.bounds[w], cause)?;
                pathset(&mut self.h, x, w, w);
            }
            if self.d[z] == self.bounds[z] - self.bounds[y] {
                let from = self.h[y];
                pathset(&mut self.h, from, j - 1, y);
                self.h[y] = j - 1;
            }
        }
        Ok(changed)
    }

    /// The mirror of `filter_lower`: adjusts the upper bounds by decreasing
    /// lower bound
    fn filter_upper(
        &mut self,
        store: &mut dyn ExplainedStore,
        cause: &Cause,
    ) -> CPResult<bool> {
        let nb = self.nb_bounds;
        for i in 0..=nb {
            self.t[i] = i + 1;
            self.h[i] = i + 1;
            self.d[i] = self.bounds[i + 1] - self.bounds[i];
        }

        let mut changed = false;
        for i in (0..self.vars.len()).rev() {
            let vi = self.minsorted[i];
            let x = self.maxrank[vi];
            let y = self.minrank[vi];
            let mut z = pathmin(&self.t, x - 1);
            let j = self.t[z];

            self.d[z] -= 1;
            if self.d[z] == 0 {
                self.t[z] = z - 1;
                z = pathmin(&self.t, self.t[z]);
                self.t[z] = j;
            }
            pathset(&mut self.t, x - 1, z, z);

            if self.d[z] < self.bounds[y] - self.bounds[z] {
                return Err(store.failure());
            }
            if self.h[x] < x {
                let w = pathmin(&self.h, self.h[x]);
                changed |=
                    store.update_upper_bound(self.vars[vi], self.bounds[w] - 1, cause)?;
                pathset(&mut self.h, x, w, w);
            }
            if self.d[z] == self.bounds[y] - self.bounds[z] {
                let from = self.h[y];
                pathset(&mut self.h, from, j + 1, y);
                self.h[y] = j + 1;
            }
        }
        Ok(changed)
    }
}

impl Propagator for AllDiffBounds {
    fn propagate(&mut self, store: &mut dyn ExplainedStore) -> CPResult<()> {
        if self.vars.len() <= 1 {
            return Ok(());
        }
        let cause = match store.failure() {
            Inconsistency::Propagator(c) => Cause::Propagator(c),
            failure => return Err(failure),
        };
        // our own filtering moves bounds, so iterate to a local fixpoint
        loop {
            self.snapshot(store)?;
            self.sort_it();
            let lower = self.filter_lower(store, &cause)?;
            let upper = self.filter_upper(store, &cause)?;
            if !(lower || upper) {
                return Ok(());
            }
        }
    }

    fn why(
        &self,
        deduction: Deduction,
        domains: &dyn DomainInspect,
        explanations: &ExplanationEngine,
        explanation: &mut Explanation,
    ) {
        // coarse justification: a pruning follows from the bounds of all the
        // other variables of the constraint
        for var in self.vars.iter().copied() {
            if TargetVar::Int(var) != deduction.target {
                explanations.add_bounds(domains, var, explanation);
            }
        }
    }

    fn explain_failure(
        &self,
        domains: &dyn DomainInspect,
        explanations: &ExplanationEngine,
        explanation: &mut Explanation,
    ) {
        for var in self.vars.iter().copied() {
            explanations.add_bounds(domains, var, explanation);
        }
    }

}

/// follows the pointers of `a` upward until a fixpoint is reached
fn pathmax(a: &[usize], mut i: usize) -> usize {
    while a[i] > i {
        i = a[i];
    }
    i
}
/// follows the pointers of `a` downward until a fixpoint is reached
fn pathmin(a: &[usize], mut i: usize) -> usize {
    while a[i] < i {
        i = a[i];
    }
    i
}
/// rewrites every pointer on the path from `from` to `to` with `value`
fn pathset(a: &mut [usize], from: usize, to: usize, value: usize) {
    let mut prev = from;
    while prev != to {
        let next = a[prev];
        a[prev] = value;
        prev = next;
    }
}

// #############################################################################
// ### UNIT TESTS ##############################################################
// #############################################################################

#[cfg(test)]
mod test_alldiff_bounds {
    use crate::prelude::*;

    #[test]
    fn a_feasible_instance_with_slack_prunes_nothing() {
        let mut cp = DefaultCpModel::default();
        let vars: Vec<Variable> = (0..3).map(|_| cp.new_int_var(1, 3)).collect();

        cp.install(&AllDifferent::new(vars.clone()));
        assert_eq!(Ok(()), cp.fixpoint());
        for v in vars {
            assert_eq!(3, cp.size(v));
        }
    }

    #[test]
    fn more_variables_than_values_is_infeasible() {
        let mut cp = DefaultCpModel::default();
        let vars: Vec<Variable> = (0..4).map(|_| cp.new_int_var(1, 3)).collect();

        cp.install(&AllDifferent::new(vars));
        assert!(cp.fixpoint().is_err());
    }

    #[test]
    fn a_hall_interval_pushes_the_outsider_out() {
        let mut cp = DefaultCpModel::default();
        let x1 = cp.new_int_var(1, 2);
        let x2 = cp.new_int_var(1, 2);
        let x3 = cp.new_int_var(1, 3);

        cp.install(&AllDifferent::new(vec![x1, x2, x3]));
        assert_eq!(Ok(()), cp.fixpoint());
        assert!(cp.is_fixed(x3));
        assert_eq!(Some(3), cp.min(x3));
    }

    #[test]
    fn filtering_cascades_to_a_fixpoint() {
        // the textbook staircase: each fixed bound triggers the next
        let mut cp = DefaultCpModel::default();
        let x1 = cp.new_int_var(1, 1);
        let x2 = cp.new_int_var(1, 2);
        let x3 = cp.new_int_var(1, 3);

        cp.install(&AllDifferent::new(vec![x1, x2, x3]));
        assert_eq!(Ok(()), cp.fixpoint());
        assert_eq!(Some(2), cp.min(x2));
        assert_eq!(Some(3), cp.min(x3));
    }

    #[test]
    fn fixing_a_variable_squeezes_the_others() {
        let mut cp = DefaultCpModel::default();
        let x1 = cp.new_int_var(1, 3);
        let x2 = cp.new_int_var(1, 3);
        let x3 = cp.new_int_var(1, 3);

        cp.install(&AllDifferent::new(vec![x1, x2, x3]));
        assert_eq!(Ok(()), cp.fixpoint());

        cp.save_state();
        assert_eq!(Ok(true), cp.update_upper_bound(x1, 1, &Cause::Branch(1)));
        assert_eq!(Ok(true), cp.update_upper_bound(x2, 2, &Cause::Branch(1)));
        assert_eq!(Ok(()), cp.fixpoint());
        assert_eq!(Some(2), cp.min(x2));
        assert_eq!(Some(3), cp.min(x3));
    }

    #[test]
    fn entailment_is_never_decided() {
        let mut cp = DefaultCpModel::default();
        let x = cp.new_int_var(0, 5);
        let y = cp.new_int_var(0, 5);

        let propagator = AllDiffBounds::new(vec![x, y]);
        assert_eq!(Entailment::Undefined, propagator.is_entailed(&cp));

        // even on a fully fixed domain the propagator stays active
        assert_eq!(Ok(true), cp.instantiate_to(x, 1, &Cause::Branch(1)));
        assert_eq!(Ok(true), cp.instantiate_to(y, 2, &Cause::Branch(1)));
        assert_eq!(Entailment::Undefined, propagator.is_entailed(&cp));
    }

    #[test]
    fn search_enumerates_the_permutations() {
        let mut cp = DefaultCpModel::default();
        let vars: Vec<Variable> = (0..3).map(|_| cp.new_int_var(0, 2)).collect();
        cp.install(&AllDifferent::new(vars.clone()));

        let mut solver = DefaultSolver::new(cp, vars);
        assert!(solver.find_optimal_solution().unwrap().is_some());
        assert_eq!(6, solver.n_solutions());
    }

    #[test]
    fn search_detects_the_pigeonhole_dead_end() {
        let mut cp = DefaultCpModel::default();
        let vars: Vec<Variable> = (0..4).map(|_| cp.new_int_var(1, 3)).collect();
        cp.install(&AllDifferent::new(vars.clone()));

        let mut solver = DefaultSolver::new(cp, vars);
        assert_eq!(Ok(None), solver.find_solution());
    }
}
