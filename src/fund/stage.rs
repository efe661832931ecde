//! Fund lifecycle.
//!
//! `Open -> Trading -> Settlement -> Closed`, strictly forward, one step at a time.
//! The helpers here are pure; persistence of the new stage happens in the
//! service, inside the same transaction that records the transition.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::{FundError, FundResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FundStage {
    /// Deposits and fee-free withdrawals.
    Open,
    /// Manager trades; withdrawals pay the early-exit fee.
    Trading,
    /// No new exposure; positions are wound down.
    Settlement,
    /// Terminal. Redemptions at the final share price.
    Closed,
}

impl Default for FundStage {
    fn default() -> Self {
        FundStage::Open
    }
}

impl fmt::Display for FundStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage-changing operator actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageAction {
    StartTrading,
    EndTrading,
    Finalize,
}

impl StageAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageAction::StartTrading => "start trading",
            StageAction::EndTrading => "end trading",
            StageAction::Finalize => "finalize",
        }
    }

    /// The only stage this action may be invoked from.
    pub fn required_stage(&self) -> FundStage {
        match self {
            StageAction::StartTrading => FundStage::Open,
            StageAction::EndTrading => FundStage::Trading,
            StageAction::Finalize => FundStage::Settlement,
        }
    }
}

impl FundStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FundStage::Open => "open",
            FundStage::Trading => "trading",
            FundStage::Settlement => "settlement",
            FundStage::Closed => "closed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "open" => Some(FundStage::Open),
            "trading" => Some(FundStage::Trading),
            "settlement" => Some(FundStage::Settlement),
            "closed" => Some(FundStage::Closed),
            _ => None,
        }
    }

    pub fn next(&self) -> Option<FundStage> {
        match self {
            FundStage::Open => Some(FundStage::Trading),
            FundStage::Trading => Some(FundStage::Settlement),
            FundStage::Settlement => Some(FundStage::Closed),
            FundStage::Closed => None,
        }
    }

    /// Stage reached by applying `action`, or `InvalidStageTransition`.
    pub fn transition(&self, action: StageAction) -> FundResult<FundStage> {
        if *self != action.required_stage() {
            return Err(FundError::InvalidStageTransition {
                from: *self,
                action: action.as_str(),
            });
        }
        self.next().ok_or(FundError::InvalidStageTransition {
            from: *self,
            action: action.as_str(),
        })
    }

    pub fn accepts_deposits(&self) -> bool {
        matches!(self, FundStage::Open)
    }

    /// Direct (immediate) withdrawals. Settlement is a closed window.
    pub fn accepts_withdrawals(&self) -> bool {
        matches!(self, FundStage::Open | FundStage::Trading | FundStage::Closed)
    }

    pub fn charges_early_exit(&self) -> bool {
        matches!(self, FundStage::Trading)
    }

    pub fn accepts_buys(&self) -> bool {
        matches!(self, FundStage::Trading)
    }

    pub fn accepts_sells(&self) -> bool {
        matches!(self, FundStage::Trading | FundStage::Settlement)
    }

    pub fn accepts_withdrawal_requests(&self) -> bool {
        matches!(self, FundStage::Trading)
    }

    pub fn processes_withdrawal_requests(&self) -> bool {
        matches!(self, FundStage::Trading | FundStage::Settlement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [FundStage; 4] = [
        FundStage::Open,
        FundStage::Trading,
        FundStage::Settlement,
        FundStage::Closed,
    ];
    const ACTIONS: [StageAction; 3] = [
        StageAction::StartTrading,
        StageAction::EndTrading,
        StageAction::Finalize,
    ];

    #[test]
    fn forward_path() {
        let s = FundStage::Open;
        let s = s.transition(StageAction::StartTrading).unwrap();
        assert_eq!(s, FundStage::Trading);
        let s = s.transition(StageAction::EndTrading).unwrap();
        assert_eq!(s, FundStage::Settlement);
        let s = s.transition(StageAction::Finalize).unwrap();
        assert_eq!(s, FundStage::Closed);
    }

    #[test]
    fn every_other_pair_is_rejected() {
        for stage in ALL {
            for action in ACTIONS {
                let res = stage.transition(action);
                if stage == action.required_stage() {
                    assert!(res.unwrap() > stage);
                } else {
                    assert!(matches!(
                        res,
                        Err(FundError::InvalidStageTransition { from, .. }) if from == stage
                    ));
                }
            }
        }
    }

    #[test]
    fn start_trading_twice_fails() {
        let trading = FundStage::Open.transition(StageAction::StartTrading).unwrap();
        assert!(trading.transition(StageAction::StartTrading).is_err());
    }

    #[test]
    fn withdrawal_policy() {
        assert!(FundStage::Open.accepts_withdrawals());
        assert!(FundStage::Trading.accepts_withdrawals());
        assert!(!FundStage::Settlement.accepts_withdrawals());
        assert!(FundStage::Closed.accepts_withdrawals());
        assert!(FundStage::Open.accepts_deposits());
        assert!(!FundStage::Trading.accepts_deposits());
    }

    #[test]
    fn round_trips_through_str() {
        for stage in ALL {
            assert_eq!(FundStage::from_str(stage.as_str()), Some(stage));
        }
        assert_eq!(FundStage::from_str("bogus"), None);
    }
}
