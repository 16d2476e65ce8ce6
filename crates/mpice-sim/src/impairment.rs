use std::fmt;

use serde::Serialize;

/// `tc qdisc` verb used to install or modify a netem rule.
///
/// A probability-loss rule can only be modified once it is present, so
/// clearing loss always goes through [`NetemVerb::Change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetemVerb {
    Add,
    Change,
}

impl NetemVerb {
    pub fn as_str(self) -> &'static str {
        match self {
            NetemVerb::Add => "add",
            NetemVerb::Change => "change",
        }
    }
}

impl fmt::Display for NetemVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shaping parameters carried by one link endpoint's root netem qdisc.
///
/// `change` replaces the whole parameter set, so the delay configured at
/// link creation is always re-sent alongside the loss value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct NetemRule {
    pub delay_ms: Option<u32>,
    pub loss_percent: Option<f32>,
}

impl NetemRule {
    pub fn delay(delay_ms: u32) -> Self {
        Self {
            delay_ms: Some(delay_ms),
            loss_percent: None,
        }
    }

    pub fn with_loss(mut self, percent: f32) -> Self {
        self.loss_percent = Some(percent);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.delay_ms.is_none() && self.loss_percent.is_none()
    }

    /// Parameters following `netem` on the `tc` command line.
    pub fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(delay) = self.delay_ms {
            args.push("delay".into());
            args.push(format!("{}ms", delay));
        }
        if let Some(loss) = self.loss_percent {
            args.push("loss".into());
            args.push(format!("{}%", loss));
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netem_args_keep_delay_with_loss() {
        let rule = NetemRule::delay(8).with_loss(100.0);
        assert_eq!(rule.args(), vec!["delay", "8ms", "loss", "100%"]);

        let cleared = NetemRule::delay(8).with_loss(0.0);
        assert_eq!(cleared.args(), vec!["delay", "8ms", "loss", "0%"]);

        assert!(NetemRule::default().is_empty());
        assert_eq!(
            NetemRule::default().with_loss(12.5).args(),
            vec!["loss", "12.5%"]
        );
    }
}
