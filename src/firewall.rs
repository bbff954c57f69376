//! nftables rulesets for the gateway and tenant namespaces.

use crate::config::NdmzConfig;
use crate::error::Result;
use tera::{Context, Tera};

const NR_TEMPLATE: &str = include_str!("../templates/nr.nft");
const NDMZ_TEMPLATE: &str = include_str!("../templates/ndmz.nft");

fn render(name: &str, source: &str, context: &Context) -> Result<String> {
    let mut tera = Tera::default();
    tera.add_raw_template(name, source)?;
    Ok(tera.render(name, context)?)
}

/// Ruleset of a tenant namespace: masquerade on the uplink, stateful filter.
pub fn nr_ruleset(public_iface: &str) -> Result<String> {
    let mut context = Context::new();
    context.insert("public_iface", public_iface);
    render("nr.nft", NR_TEMPLATE, &context)
}

/// Ruleset of the public gateway namespace.
pub fn ndmz_ruleset(config: &NdmzConfig) -> Result<String> {
    let ports = config
        .overlay_ports
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(", ");

    let mut context = Context::new();
    context.insert("pub4_iface", &config.pub4_iface);
    context.insert("pub6_iface", &config.pub6_iface);
    context.insert("tonrs_iface", &config.tonrs_iface);
    context.insert("overlay_ports", &ports);
    render("ndmz.nft", NDMZ_TEMPLATE, &context)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nr_ruleset() {
        let rules = nr_ruleset("public").unwrap();
        assert!(rules.starts_with("flush ruleset"));
        assert!(rules.contains(r#"oifname "public" masquerade"#));
        assert!(rules.contains("ct state established,related accept"));
        assert!(rules.contains("ct state invalid drop"));
        assert!(rules.contains("policy accept"));
    }

    #[test]
    fn test_ndmz_ruleset_opens_overlay_ports() {
        let rules = ndmz_ruleset(&NdmzConfig::default()).unwrap();
        assert!(rules.contains("tcp dport { 9943, 9944, 9945 } accept"));
        assert!(rules.contains(r#"oifname "npub4" masquerade"#));
        assert!(rules.contains(r#"oifname "npub6" masquerade"#));

        let closed = NdmzConfig {
            overlay_ports: vec![],
            ..NdmzConfig::default()
        };
        let rules = ndmz_ruleset(&closed).unwrap();
        assert!(!rules.contains("dport"));
    }
}
