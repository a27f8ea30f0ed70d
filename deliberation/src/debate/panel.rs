//! Expert catalog and panel selection.

use std::collections::HashSet;

use crate::state::{Expert, ExpertPanel};

/// Static set of expert personas.
#[derive(Debug, Clone)]
pub struct ExpertCatalog {
    experts: Vec<Expert>,
}

fn expert(id: &str, name: &str, tags: &[&str], style: &str) -> Expert {
    Expert {
        id: id.to_string(),
        name: name.to_string(),
        expertise_tags: tags.iter().map(|t| t.to_string()).collect(),
        style: style.to_string(),
    }
}

impl ExpertCatalog {
    pub fn new(experts: Vec<Expert>) -> Self {
        Self { experts }
    }

    /// Eight generalist personas covering common decision dimensions.
    pub fn builtin() -> Self {
        Self::new(vec![
            expert(
                "strategist",
                "Strategy Lead",
                &["strategy", "business", "growth", "competition", "market"],
                "big-picture, trade-off driven",
            ),
            expert(
                "finance",
                "Financial Analyst",
                &["finance", "cost", "budget", "pricing", "revenue", "investment"],
                "quantitative, skeptical of unpriced assumptions",
            ),
            expert(
                "risk",
                "Risk Officer",
                &["risk", "security", "compliance", "legal", "privacy"],
                "cautious, enumerates failure modes",
            ),
            expert(
                "engineering",
                "Principal Engineer",
                &["engineering", "technical", "architecture", "infrastructure", "software", "migration", "system"],
                "concrete, implementation-focused",
            ),
            expert(
                "operations",
                "Operations Manager",
                &["operations", "process", "delivery", "logistics", "timeline", "support"],
                "pragmatic, focused on execution",
            ),
            expert(
                "customer",
                "Customer Advocate",
                &["customer", "user", "product", "experience", "adoption"],
                "empathetic, outcome-oriented",
            ),
            expert(
                "people",
                "People Lead",
                &["people", "team", "hiring", "culture", "stakeholders", "organization"],
                "collaborative, attentive to incentives",
            ),
            expert(
                "data",
                "Data Scientist",
                &["data", "analytics", "metrics", "measurement", "evidence", "experiment"],
                "evidence-first, asks how we will know",
            ),
        ])
    }

    /// Configured experts, or the built-in set when none are configured.
    pub fn from_experts(experts: &[Expert]) -> Self {
        if experts.is_empty() {
            Self::builtin()
        } else {
            Self::new(experts.to_vec())
        }
    }

    pub fn experts(&self) -> &[Expert] {
        &self.experts
    }

    pub fn len(&self) -> usize {
        self.experts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.experts.is_empty()
    }
}

fn words(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_string)
        .collect()
}

/// Picks a panel for a sub-problem goal.
///
/// Experts are ranked by how many of their tags appear in the goal (ties
/// keep catalog order). Each primary expertise is seated at most once.
pub struct PanelSelector<'a> {
    catalog: &'a ExpertCatalog,
    size: usize,
}

impl<'a> PanelSelector<'a> {
    pub fn new(catalog: &'a ExpertCatalog, size: usize) -> Self {
        Self {
            catalog,
            size: size.clamp(ExpertPanel::MIN_SIZE, ExpertPanel::MAX_SIZE),
        }
    }

    fn relevance(expert: &Expert, goal_words: &HashSet<String>) -> usize {
        expert
            .expertise_tags
            .iter()
            .filter(|tag| words(tag).iter().any(|w| goal_words.contains(w)))
            .count()
    }

    pub fn select(&self, goal: &str) -> Result<ExpertPanel, String> {
        let goal_words = words(goal);
        let mut ranked: Vec<(usize, usize)> = self
            .catalog
            .experts()
            .iter()
            .enumerate()
            .map(|(i, e)| (Self::relevance(e, &goal_words), i))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut seated: Vec<Expert> = Vec::with_capacity(self.size);
        let mut primaries = HashSet::new();
        let mut ids = HashSet::new();
        for (_, i) in ranked {
            let candidate = &self.catalog.experts()[i];
            let primary = candidate
                .primary_tag()
                .map(str::to_lowercase)
                .unwrap_or_else(|| candidate.id.clone());
            if ids.contains(&candidate.id) || !primaries.insert(primary) {
                continue;
            }
            ids.insert(candidate.id.clone());
            seated.push(candidate.clone());
            if seated.len() == self.size {
                break;
            }
        }

        if seated.len() < ExpertPanel::MIN_SIZE {
            return Err(format!(
                "only {} eligible experts, need {}",
                seated.len(),
                ExpertPanel::MIN_SIZE
            ));
        }
        ExpertPanel::new(seated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_catalog_has_distinct_primaries() {
        let catalog = ExpertCatalog::builtin();
        assert_eq!(catalog.len(), 8);
        let primaries: HashSet<_> = catalog
            .experts()
            .iter()
            .filter_map(|e| e.primary_tag())
            .collect();
        assert_eq!(primaries.len(), 8);
    }

    #[test]
    fn test_relevant_experts_ranked_first() {
        let catalog = ExpertCatalog::builtin();
        let panel = PanelSelector::new(&catalog, 4)
            .select("Estimate migration cost and budget risk")
            .unwrap();
        let ids = panel.ids();
        assert_eq!(ids.len(), 4);
        assert_eq!(ids[0], "finance");
        assert!(ids.contains(&"risk".to_string()));
        assert!(ids.contains(&"engineering".to_string()));
    }

    #[test]
    fn test_size_is_clamped() {
        let catalog = ExpertCatalog::builtin();
        assert_eq!(PanelSelector::new(&catalog, 1).select("x").unwrap().len(), 3);
        assert_eq!(PanelSelector::new(&catalog, 9).select("x").unwrap().len(), 5);
    }

    #[test]
    fn test_duplicate_primary_skipped() {
        let catalog = ExpertCatalog::new(vec![
            expert("a", "A", &["finance"], "s"),
            expert("b", "B", &["finance", "cost"], "s"),
            expert("c", "C", &["legal"], "s"),
            expert("d", "D", &["ops"], "s"),
        ]);
        let panel = PanelSelector::new(&catalog, 3).select("cost review").unwrap();
        assert_eq!(panel.ids(), vec!["b", "c", "d"]);
    }

    #[test]
    fn test_too_few_experts() {
        let catalog = ExpertCatalog::new(vec![
            expert("a", "A", &["finance"], "s"),
            expert("b", "B", &["finance"], "s"),
            expert("c", "C", &["legal"], "s"),
        ]);
        assert!(PanelSelector::new(&catalog, 3).select("anything").is_err());
    }
}
