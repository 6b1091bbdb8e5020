//! Registry of named experiments and experiment groups.
//!
//! Each experiment points at a YAML file stem under the configs directory and
//! the run name used for its log directory.

/// A registered experiment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Experiment {
    /// Key used on the command line.
    pub key: &'static str,
    /// Config file stem (`<configs_dir>/<config>.yaml`).
    pub config: &'static str,
    /// Run name, prefix of the log directory.
    pub name: &'static str,
    pub description: &'static str,
}

pub const EXPERIMENTS: &[Experiment] = &[
    Experiment {
        key: "baseline",
        config: "baseline_60epoch",
        name: "baseline_resnet50",
        description: "Baseline ResNet50 with standard settings",
    },
    Experiment {
        key: "enhanced_baseline",
        config: "enhanced_baseline",
        name: "enhanced_resnet50",
        description: "Enhanced baseline with improved augmentations",
    },
    Experiment {
        key: "densenet",
        config: "arch_densenet121",
        name: "arch_densenet121",
        description: "DenseNet121 architecture comparison",
    },
    Experiment {
        key: "osnet",
        config: "arch_osnet",
        name: "arch_osnet",
        description: "OSNet architecture comparison",
    },
    Experiment {
        key: "optimized",
        config: "optimized_experiment",
        name: "optimized_osnet",
        description: "Optimized OSNet with enhanced settings",
    },
    Experiment {
        key: "triplet",
        config: "loss_pure_triplet",
        name: "loss_pure_triplet",
        description: "Pure triplet loss without cross-entropy",
    },
    Experiment {
        key: "contrastive",
        config: "contrastive_loss",
        name: "contrastive_siamese",
        description: "Contrastive loss with siamese network",
    },
    Experiment {
        key: "sampling",
        config: "sampling_many_instances",
        name: "sampling_8instances",
        description: "Many instances sampling strategy (8 per identity)",
    },
    Experiment {
        key: "hard_mining",
        config: "hard_mining_experiment",
        name: "hard_mining_osnet",
        description: "Hard negative mining strategy",
    },
    Experiment {
        key: "advanced",
        config: "advanced_optimization",
        name: "advanced_osnet",
        description: "Advanced optimization with staged decay",
    },
    Experiment {
        key: "margin_01",
        config: "ablation_margin_01",
        name: "margin_01",
        description: "Triplet margin ablation (0.1)",
    },
    Experiment {
        key: "margin_05",
        config: "ablation_margin_05",
        name: "margin_05",
        description: "Triplet margin ablation (0.5)",
    },
    Experiment {
        key: "best",
        config: "best_combination",
        name: "best_combination",
        description: "Best combination of all techniques",
    },
    Experiment {
        key: "cosine",
        config: "cosine_distance",
        name: "cosine_distance",
        description: "Cosine distance metric experiment",
    },
    Experiment {
        key: "warmup",
        config: "warmup_experiment",
        name: "warmup_experiment",
        description: "Learning rate warmup experiment",
    },
];

/// Named groups. `all` is not listed here; it expands to every experiment.
pub const GROUPS: &[(&str, &[&str])] = &[
    (
        "core",
        &[
            "baseline",
            "densenet",
            "osnet",
            "optimized",
            "triplet",
            "contrastive",
            "sampling",
            "hard_mining",
            "margin_01",
            "margin_05",
            "best",
        ],
    ),
    ("architecture", &["baseline", "densenet", "osnet", "optimized"]),
    ("loss", &["baseline", "triplet", "contrastive"]),
    ("sampling", &["baseline", "sampling", "hard_mining", "advanced"]),
    ("ablation", &["baseline", "margin_01", "margin_05"]),
    ("quick", &["baseline", "osnet", "triplet"]),
    ("baseline_only", &["baseline"]),
    ("best_only", &["best"]),
];

pub fn find(key: &str) -> Option<&'static Experiment> {
    EXPERIMENTS.iter().find(|e| e.key == key)
}

/// Members of a group, `all` included.
pub fn group(name: &str) -> Option<Vec<&'static str>> {
    if name == "all" {
        return Some(EXPERIMENTS.iter().map(|e| e.key).collect());
    }
    GROUPS
        .iter()
        .find(|(g, _)| *g == name)
        .map(|(_, members)| members.to_vec())
}

/// Group names in display order.
pub fn group_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = GROUPS.iter().map(|(g, _)| *g).collect();
    names.insert(names.len().min(5), "all");
    names
}

/// Experiments selected by a list of names, plus the names that matched
/// nothing.
#[derive(Debug, Default)]
pub struct Resolution {
    pub experiments: Vec<&'static Experiment>,
    pub unknown: Vec<String>,
}

/// Expand groups and single keys in order, keeping the first occurrence of
/// each experiment. A name that is both a group and a key (`sampling`) is
/// treated as the group.
pub fn resolve<S: AsRef<str>>(args: &[S]) -> Resolution {
    fn push(exp: &'static Experiment, out: &mut Vec<&'static Experiment>) {
        if !out.iter().any(|e| e.key == exp.key) {
            out.push(exp);
        }
    }

    let mut resolution = Resolution::default();

    for arg in args {
        let arg = arg.as_ref();
        if let Some(members) = group(arg) {
            tracing::info!(group = arg, ?members, "Added group");
            for key in members {
                if let Some(exp) = find(key) {
                    push(exp, &mut resolution.experiments);
                }
            }
        } else if let Some(exp) = find(arg) {
            tracing::info!(experiment = arg, "Added experiment");
            push(exp, &mut resolution.experiments);
        } else {
            tracing::warn!(name = arg, "Unknown experiment/group, ignoring");
            resolution.unknown.push(arg.to_string());
        }
    }
    resolution
}

/// Text for `--list`.
pub fn listing() -> String {
    let mut out = String::from("Available experiments:\n");
    for e in EXPERIMENTS {
        out.push_str(&format!("  {:17} - {}\n", e.key, e.description));
    }
    out.push_str("\nAvailable groups:\n");
    for name in group_names() {
        let members = group(name).unwrap_or_default();
        let preview = members.iter().take(3).copied().collect::<Vec<_>>().join(", ");
        let more = if members.len() > 3 { "..." } else { "" };
        out.push_str(&format!(
            "  {:17} - {} experiments: {preview}{more}\n",
            name,
            members.len()
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(r: &Resolution) -> Vec<&'static str> {
        r.experiments.iter().map(|e| e.key).collect()
    }

    #[test]
    fn test_group_members_are_registered() {
        for (name, members) in GROUPS {
            for key in *members {
                assert!(find(key).is_some(), "group {name} references unknown {key}");
            }
        }
        let mut seen = std::collections::HashSet::new();
        assert!(EXPERIMENTS.iter().all(|e| seen.insert(e.key)), "duplicate key");
    }

    #[test]
    fn test_resolve_dedupes_in_order() {
        let r = resolve(&["quick", "baseline", "architecture"]);
        assert_eq!(keys(&r), vec!["baseline", "osnet", "triplet", "densenet", "optimized"]);
        assert!(r.unknown.is_empty());
    }

    #[test]
    fn test_resolve_unknown_ignored() {
        let r = resolve(&["nope", "best", "siamese"]);
        assert_eq!(keys(&r), vec!["best"]);
        assert_eq!(r.unknown, vec!["nope".to_string(), "siamese".to_string()]);
    }

    #[test]
    fn test_loss_group_keeps_contrastive() {
        let r = resolve(&["loss"]);
        assert_eq!(keys(&r), vec!["baseline", "triplet", "contrastive"]);
        assert_eq!(group("core").unwrap().len(), 11);
        assert!(group("all").unwrap().contains(&"contrastive"));
    }

    #[test]
    fn test_group_takes_precedence_over_key() {
        let r = resolve(&["sampling"]);
        assert_eq!(keys(&r), vec!["baseline", "sampling", "hard_mining", "advanced"]);
    }

    #[test]
    fn test_all_and_listing() {
        assert_eq!(group("all").unwrap().len(), EXPERIMENTS.len());
        assert!(group("missing").is_none());
        let text = listing();
        assert!(text.contains("baseline_only"));
        assert!(text.contains("all"));
        assert!(text.contains("Triplet margin ablation (0.1)"));
    }
}
