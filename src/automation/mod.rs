//! Automation hooks (spec.md §4.7): regex-matched auto-ack, first-contact
//! welcome, and the sending side of scheduled auto-announce. Each hook is a
//! pure-ish function the Ingest Pipeline or Scheduler calls at the moment
//! its trigger fires; state that must survive restart (the auto-ack reply
//! suppression check, welcome-once tracking) lives in the Store.

use crate::config::AutomationConfig;
use crate::error::CoreError;
use crate::session::{OutboundCommand, SessionHandle};
use crate::store::models::node_id_from_num;
use crate::store::Store;
use regex::Regex;

fn render_template(template: &str, from_node_id: &str, short_name: &str) -> String {
    template
        .replace("{from}", from_node_id)
        .replace("{shortName}", short_name)
}

/// Enqueues the configured reply if `text` matches the configured auto-ack
/// regex, the sender isn't us, and the channel is in scope (or `channel`
/// is `-1` and DM auto-ack is enabled). Loop-safe: never re-acks a message
/// whose text is exactly what we would have sent this sender (spec.md §8
/// scenario S5).
pub async fn maybe_auto_ack(
    cfg: &AutomationConfig,
    session: &SessionHandle,
    local_node_num: Option<u32>,
    from_node_num: u32,
    short_name: &str,
    channel: i32,
    text: &str,
) -> Result<(), CoreError> {
    if !cfg.auto_ack_enabled {
        return Ok(());
    }
    if local_node_num == Some(from_node_num) {
        return Ok(());
    }
    let in_scope = if channel < 0 {
        cfg.auto_ack_dm
    } else {
        cfg.auto_ack_channels.is_empty() || cfg.auto_ack_channels.contains(&channel)
    };
    if !in_scope {
        return Ok(());
    }

    let re = Regex::new(&cfg.auto_ack_regex)
        .map_err(|e| CoreError::Validation(format!("invalid auto_ack_regex: {e}")))?;
    if !re.is_match(text) {
        return Ok(());
    }

    let from_node_id = node_id_from_num(from_node_num);
    let rendered = render_template(&cfg.auto_ack_reply_template, &from_node_id, short_name);
    if text == rendered {
        // Would be replying to our own echoed reply; never loop.
        return Ok(());
    }

    let packet_id = session.allocate_packet_id();
    session.send(OutboundCommand::SendText {
        text: rendered,
        channel,
        destination: if channel < 0 { Some(from_node_num) } else { None },
        reply_id: None,
        emoji: 0,
        packet_id,
        ack_tx: None,
    })?;
    Ok(())
}

/// The two triggers spec.md §4.7 names for first-contact welcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WelcomeTrigger {
    NodeInfo,
    FirstMessage,
}

/// Sends the configured welcome at most once per node, ever (tracked by
/// `Node.welcomed_at`). If `wait_for_name` is set, defers until the node has
/// advertised a non-empty `long_name`.
pub async fn maybe_auto_welcome(
    cfg: &AutomationConfig,
    store: &Store,
    session: &SessionHandle,
    node_num: u32,
    short_name: &str,
    long_name: Option<&str>,
    now: i64,
    _trigger: WelcomeTrigger,
) -> Result<(), CoreError> {
    if !cfg.auto_welcome_enabled {
        return Ok(());
    }
    if cfg.auto_welcome_wait_for_name && long_name.map(str::is_empty).unwrap_or(true) {
        return Ok(());
    }

    let Some(node) = store.get_node(node_num).await? else {
        return Ok(());
    };
    if node.welcomed_at.is_some() {
        return Ok(());
    }

    let from_node_id = node_id_from_num(node_num);
    let rendered = render_template(&cfg.auto_welcome_message, &from_node_id, short_name);
    let packet_id = session.allocate_packet_id();
    session.send(OutboundCommand::SendText {
        text: rendered,
        channel: -1,
        destination: Some(node_num),
        reply_id: None,
        emoji: 0,
        packet_id,
        ack_tx: None,
    })?;
    store.mark_welcomed(node_num, now).await?;
    Ok(())
}

/// Sends the configured announce message on the configured channel; the
/// Scheduler decides *when*, this function only decides *what*.
pub async fn send_announce(cfg: &AutomationConfig, session: &SessionHandle) -> Result<(), CoreError> {
    if !cfg.auto_announce_enabled {
        return Ok(());
    }
    let packet_id = session.allocate_packet_id();
    session.send(OutboundCommand::SendText {
        text: cfg.auto_announce_message.clone(),
        channel: cfg.auto_announce_channel,
        destination: None,
        reply_id: None,
        emoji: 0,
        packet_id,
        ack_tx: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_rendering_substitutes_both_placeholders() {
        let out = render_template("ack: {from} ({shortName})", "!a2e175b8", "N1X");
        assert_eq!(out, "ack: !a2e175b8 (N1X)");
    }

    #[test]
    fn template_rendering_is_noop_without_placeholders() {
        assert_eq!(render_template("hello", "!1", "x"), "hello");
    }
}
