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

//! This module defines the branching decisions of the search: the operators
//! a decision may carry, and how they translate into domain mutations in the
//! positive branch (`apply`) and in the negative one (`unapply`).

use crate::{CPResult, Cause, ExplainedStore, SetVariable, TargetVar, Variable};

/// The operator carried by a branching decision. Each operator splits the
/// search space in two: applying it explores one half, unapplying it
/// explores the complement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecisionOperator {
    /// x == v  /  x != v
    Eq,
    /// x != v  /  x == v
    Neq,
    /// x <= v  /  x >  v
    Split,
    /// x >= v  /  x <  v
    ReverseSplit,
    /// v in s  /  v not in s  (set variables only)
    SetForce,
    /// v not in s  /  v in s  (set variables only)
    SetRemove,
}
impl DecisionOperator {
    /// Returns the operator whose apply is this operator's unapply. The
    /// mapping is an involution.
    pub fn opposite(self) -> Self {
        match self {
            Self::Eq => Self::Neq,
            Self::Neq => Self::Eq,
            Self::Split => Self::ReverseSplit,
            Self::ReverseSplit => Self::Split,
            Self::SetForce => Self::SetRemove,
            Self::SetRemove => Self::SetForce,
        }
    }
    /// Returns true iff this operator targets a set variable
    pub fn is_set_operator(self) -> bool {
        matches!(self, Self::SetForce | Self::SetRemove)
    }
}

/// A branching decision: an operator applied to a (variable, value) pair.
/// The `refuted` flag tells whether the search has already flipped it and is
/// now exploring its negative branch.
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    /// the operator of this decision
    pub operator: DecisionOperator,
    /// the targeted variable
    pub target: TargetVar,
    /// the pivot value
    pub value: isize,
    /// true iff the search already explores the negation of this decision
    pub refuted: bool,
}
impl Decision {
    /// Creates a decision on an integer variable
    pub fn on_int(operator: DecisionOperator, var: Variable, value: isize) -> Self {
        Self {
            operator,
            target: TargetVar::Int(var),
            value,
            refuted: false,
        }
    }
    /// Creates a decision on a set variable
    pub fn on_set(operator: DecisionOperator, var: SetVariable, value: isize) -> Self {
        Self {
            operator,
            target: TargetVar::Set(var),
            value,
            refuted: false,
        }
    }

    /// Enforces this decision on the given store (positive branch). Returns
    /// true iff the domain actually changed.
    pub fn apply(&self, store: &mut dyn ExplainedStore, cause: &Cause) -> CPResult<bool> {
        match (self.operator, self.target) {
            (DecisionOperator::Eq, TargetVar::Int(x)) => {
                store.instantiate_to(x, self.value, cause)
            }
            (DecisionOperator::Neq, TargetVar::Int(x)) => {
                store.remove_value(x, self.value, cause)
            }
            (DecisionOperator::Split, TargetVar::Int(x)) => {
                store.update_upper_bound(x, self.value, cause)
            }
            (DecisionOperator::ReverseSplit, TargetVar::Int(x)) => {
                store.update_lower_bound(x, self.value, cause)
            }
            (DecisionOperator::SetForce, TargetVar::Set(s)) => {
                store.set_force(s, self.value, cause)
            }
            (DecisionOperator::SetRemove, TargetVar::Set(s)) => {
                store.set_exclude(s, self.value, cause)
            }
            (op, target) => panic!("operator {:?} cannot target {:?}", op, target),
        }
    }
    /// Enforces the negation of this decision on the given store. Returns
    /// true iff the domain actually changed.
    pub fn unapply(&self, store: &mut dyn ExplainedStore, cause: &Cause) -> CPResult<bool> {
        match (self.operator, self.target) {
            (DecisionOperator::Eq, TargetVar::Int(x)) => {
                store.remove_value(x, self.value, cause)
            }
            (DecisionOperator::Neq, TargetVar::Int(x)) => {
                store.instantiate_to(x, self.value, cause)
            }
            (DecisionOperator::Split, TargetVar::Int(x)) => {
                store.update_lower_bound(x, self.value + 1, cause)
            }
            (DecisionOperator::ReverseSplit, TargetVar::Int(x)) => {
                store.update_upper_bound(x, self.value - 1, cause)
            }
            (DecisionOperator::SetForce, TargetVar::Set(s)) => {
                store.set_exclude(s, self.value, cause)
            }
            (DecisionOperator::SetRemove, TargetVar::Set(s)) => {
                store.set_force(s, self.value, cause)
            }
            (op, target) => panic!("operator {:?} cannot target {:?}", op, target),
        }
    }
}

// #############################################################################
// ### UNIT TESTS ##############################################################
// #############################################################################

#[cfg(test)]
mod test_decisions {
    use super::*;
    use crate::{DefaultCpModel, DomainInspect, DomainStore};

    #[test]
    fn opposite_is_an_involution() {
        let all = [
            DecisionOperator::Eq,
            DecisionOperator::Neq,
            DecisionOperator::Split,
            DecisionOperator::ReverseSplit,
            DecisionOperator::SetForce,
            DecisionOperator::SetRemove,
        ];
        for op in all {
            assert_eq!(op, op.opposite().opposite());
            assert_ne!(op, op.opposite());
        }
    }

    #[test]
    fn eq_apply_fixes_and_unapply_removes() {
        let mut cp = DefaultCpModel::default();
        let x = cp.new_int_var(0, 9);

        let d = Decision::on_int(DecisionOperator::Eq, x, 4);
        assert_eq!(Ok(true), d.apply(&mut cp, &Cause::Branch(1)));
        assert!(cp.is_fixed(x));
        assert_eq!(Some(4), cp.min(x));

        let mut cp = DefaultCpModel::default();
        let x = cp.new_int_var(0, 9);
        let d = Decision::on_int(DecisionOperator::Eq, x, 4);
        assert_eq!(Ok(true), d.unapply(&mut cp, &Cause::Branch(1)));
        assert!(!cp.contains(x, 4));
        assert_eq!(9, cp.size(x));
    }

    #[test]
    fn split_apply_caps_the_max_and_unapply_bumps_the_min() {
        let mut cp = DefaultCpModel::default();
        let x = cp.new_int_var(0, 9);

        let d = Decision::on_int(DecisionOperator::Split, x, 4);
        assert_eq!(Ok(true), d.apply(&mut cp, &Cause::Branch(1)));
        assert_eq!(Some(4), cp.max(x));

        let mut cp = DefaultCpModel::default();
        let x = cp.new_int_var(0, 9);
        let d = Decision::on_int(DecisionOperator::Split, x, 4);
        assert_eq!(Ok(true), d.unapply(&mut cp, &Cause::Branch(1)));
        assert_eq!(Some(5), cp.min(x));
    }

    #[test]
    fn apply_and_unapply_report_whether_the_domain_changed() {
        let mut cp = DefaultCpModel::default();
        let x = cp.new_int_var(0, 9);

        // capping the max at its current value touches nothing
        let d = Decision::on_int(DecisionOperator::Split, x, 9);
        assert_eq!(Ok(false), d.apply(&mut cp, &Cause::Branch(1)));

        let d = Decision::on_int(DecisionOperator::Split, x, 4);
        assert_eq!(Ok(true), d.apply(&mut cp, &Cause::Branch(1)));
        assert_eq!(Ok(false), d.apply(&mut cp, &Cause::Branch(1)));

        let d = Decision::on_int(DecisionOperator::Neq, x, 2);
        assert_eq!(Ok(true), d.apply(&mut cp, &Cause::Branch(1)));
        assert_eq!(Ok(false), d.apply(&mut cp, &Cause::Branch(1)));
    }

    #[test]
    fn reverse_split_mirrors_split() {
        let mut cp = DefaultCpModel::default();
        let x = cp.new_int_var(0, 9);

        let d = Decision::on_int(DecisionOperator::ReverseSplit, x, 4);
        assert_eq!(Ok(true), d.apply(&mut cp, &Cause::Branch(1)));
        assert_eq!(Some(4), cp.min(x));

        let mut cp = DefaultCpModel::default();
        let x = cp.new_int_var(0, 9);
        let d = Decision::on_int(DecisionOperator::ReverseSplit, x, 4);
        assert_eq!(Ok(true), d.unapply(&mut cp, &Cause::Branch(1)));
        assert_eq!(Some(3), cp.max(x));
    }

    #[test]
    fn set_force_apply_grows_the_kernel_and_unapply_shrinks_the_envelope() {
        let mut cp = DefaultCpModel::default();
        let s = cp.new_set_var(6);

        let d = Decision::on_set(DecisionOperator::SetForce, s, 2);
        assert_eq!(Ok(true), d.apply(&mut cp, &Cause::Branch(1)));
        assert!(cp.set_kernel_contains(s, 2));

        let mut cp = DefaultCpModel::default();
        let s = cp.new_set_var(6);
        let d = Decision::on_set(DecisionOperator::SetForce, s, 2);
        assert_eq!(Ok(true), d.unapply(&mut cp, &Cause::Branch(1)));
        assert!(!cp.set_envelope_contains(s, 2));
    }

    #[test]
    #[should_panic]
    fn a_set_operator_cannot_target_an_integer_variable() {
        let mut cp = DefaultCpModel::default();
        let x = cp.new_int_var(0, 9);

        let d = Decision {
            operator: DecisionOperator::SetForce,
            target: TargetVar::Int(x),
            value: 2,
            refuted: false,
        };
        let _ = d.apply(&mut cp, &Cause::Branch(1));
    }
}
