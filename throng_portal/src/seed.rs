//! One-shot generator of realistic portal data: hundreds of cases, each
//! with a long history of document versions, so that reads during a load
//! test hit a database of production-like size.

use std::{collections::HashSet, ops::RangeInclusive, time::Instant};

use anyhow::{bail, Context};
use rand::{seq::SliceRandom, Rng};
use serde_json::json;

use crate::{
    api::{BudgetRound, CreatedCase, Department, PortalApi, PASSWORD},
    workload::{paragraph, DocumentSection, DEPARTMENTS},
};

pub const CASE_TYPES: [&str; 4] = [
    "budsjettforslag",
    "tilleggsbevilgning",
    "omfordeling",
    "oppfolging",
];

const SAMPLE_TEXT: &str = "Lorem ipsum dolor sit amet, consectetur adipiscing elit. Sed do eiusmod \
tempor incididunt ut labore et dolore magna aliqua. Ut enim ad minim veniam, quis nostrud \
exercitation ullamco laboris nisi ut aliquip ex ea commodo consequat. Duis aute irure dolor in \
reprehenderit in voluptate velit esse cillum dolore eu fugiat nulla pariatur.";

const ADMIN: &str = "admin@fin.dep.no";
const PROGRESS_EVERY: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedConfig {
    pub cases: usize,
    /// Document versions written per case, drawn uniformly.
    pub versions: RangeInclusive<u32>,
    /// Size of each version's document in KiB, drawn uniformly.
    pub document_kib: RangeInclusive<usize>,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            cases: 500,
            versions: 10..=30,
            document_kib: 3..=20,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub cases_created: usize,
    pub cases_skipped: usize,
    pub versions: usize,
}

/// Editor document of roughly `size_kib` KiB made of random lorem ipsum
/// paragraphs, serialized to a string.
pub fn generate_content_json<R: Rng>(size_kib: usize, rng: &mut R) -> String {
    let words: Vec<&str> = SAMPLE_TEXT.split_whitespace().collect();
    let wanted = size_kib * 1024;

    let mut paragraphs = Vec::new();
    let mut size = 2;
    while size < wanted {
        let count = rng.gen_range(20..=50);
        let text = (0..count)
            .filter_map(|_| words.choose(rng).copied())
            .collect::<Vec<_>>()
            .join(" ");
        let p = paragraph(&text);
        size += p.to_string().len() + 1;
        paragraphs.push(p);
    }
    DocumentSection::PROPOSAL.document(paragraphs).to_string()
}

/// Creates `config.cases` cases round-robin over the departments, each with
/// a random number of document versions.
pub async fn seed<R: Rng>(
    api: &PortalApi,
    config: &SeedConfig,
    rng: &mut R,
) -> anyhow::Result<SeedSummary> {
    if config.versions.is_empty() || config.document_kib.is_empty() {
        bail!("empty version or document size range");
    }
    tracing::info!(host = api.base_url(), "Connecting...");
    let token = api
        .login(ADMIN, PASSWORD)
        .await
        .with_context(|| format!("logging in as {ADMIN}"))?;
    let token = Some(token.as_str());

    let rounds: Vec<BudgetRound> = api
        .get_json(token, "/api/budget-rounds", &[], "/api/budget-rounds")
        .await
        .context("fetching budget rounds")?;
    let round = rounds
        .iter()
        .find(|r| r.is_active())
        .or_else(|| rounds.first())
        .context("no budget round found")?;
    tracing::info!(
        round = round.name.as_deref().unwrap_or(&round.id),
        "Using budget round"
    );

    let departments: Vec<Department> = api
        .get_json(token, "/api/departments", &[], "/api/departments")
        .await
        .context("fetching departments")?;
    let known: HashSet<String> = departments.into_iter().map(|d| d.code).collect();

    let mut summary = SeedSummary::default();
    let started = Instant::now();

    for i in 0..config.cases {
        let code = DEPARTMENTS[i % DEPARTMENTS.len()];
        if !known.contains(code) {
            tracing::debug!(department = code, "Unknown department, skipping case");
            summary.cases_skipped += 1;
            continue;
        }

        let suffix: String = (0..3).map(|_| rng.gen_range(b'A'..=b'Z') as char).collect();
        let case_name = format!("Lasttestsak {} - {} {suffix}", i + 1, code.to_uppercase());
        let body = json!({
            "budgetRoundId": round.id,
            "caseName": case_name,
            "caseType": CASE_TYPES[rng.gen_range(0..CASE_TYPES.len())],
            "chapter": rng.gen_range(100..=999).to_string(),
            "post": rng.gen_range(1..=90).to_string(),
            "amount": rng.gen_range(1_000..=500_000),
            "proposalText": format!("Forslag for {case_name}"),
        });
        let created = api.post_json(token, "/api/cases", &body, "/api/cases").await;
        let case: CreatedCase = match created {
            Ok(case) => case,
            Err(e) => {
                tracing::warn!(case = i + 1, "Case creation failed: {e}");
                summary.cases_skipped += 1;
                continue;
            }
        };
        summary.cases_created += 1;

        let versions = rng.gen_range(config.versions.clone());
        for version in 1..=versions {
            let size = rng.gen_range(config.document_kib.clone());
            let body = json!({
                "contentJson": generate_content_json(size, rng),
                "expectedVersion": version,
            });
            let path = format!("/api/cases/{}/document", case.id);
            match api
                .put_json(token, &path, &body, "/api/cases/[id]/document")
                .await
            {
                Ok(()) => summary.versions += 1,
                Err(e) => tracing::debug!(case = %case.id, version, "Version write failed: {e}"),
            }
        }

        if (i + 1) % PROGRESS_EVERY == 0 {
            let rate = (i + 1) as f64 / started.elapsed().as_secs_f64();
            tracing::info!(
                "Created {}/{} cases ({} versions) - {rate:.1} cases/s",
                i + 1,
                config.cases,
                summary.versions
            );
        }
    }

    tracing::info!(
        "Done! Created {} cases with {} content versions in {:.1}s",
        summary.cases_created,
        summary.versions,
        started.elapsed().as_secs_f64()
    );
    Ok(summary)
}
