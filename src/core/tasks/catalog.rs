use crate::core::tasks::llm::PromptSpec;
use crate::core::workflow::contract::{OutputType, TaskContract};
use serde_json::{json, Value};

pub const RESUME_PARSING: &str = "resume.parsing";
pub const CHECKLIST_PARSING: &str = "checklist.parsing";
pub const CHECKLIST_MATCHING: &str = "checklist.matching";
pub const RESUME_TAILORING: &str = "resume.tailoring";
pub const JOB_METADATA: &str = "job.metadata";
pub const SCORE_CALCULATION: &str = "score.calculation";

fn string_list() -> Value {
    json!({"type": "array", "items": {"type": "string"}})
}

fn resume_schema(required: &[&str]) -> Value {
    json!({
        "type": "object",
        "required": required,
        "properties": {
            "name": {"type": "string"},
            "email": {"type": ["string", "null"]},
            "phone": {"type": ["string", "null"]},
            "summary": {"type": "string"},
            "skills": string_list(),
            "experience": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["title", "company"],
                    "properties": {
                        "title": {"type": "string"},
                        "company": {"type": "string"},
                        "startDate": {"type": ["string", "null"]},
                        "endDate": {"type": ["string", "null"]},
                        "highlights": string_list(),
                    },
                },
            },
            "education": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "institution": {"type": "string"},
                        "degree": {"type": ["string", "null"]},
                        "year": {"type": ["string", "null"]},
                    },
                },
            },
        },
    })
}

pub fn parsed_resume_type() -> OutputType {
    OutputType::new(
        "ParsedResume",
        resume_schema(&["name", "skills", "experience"]),
    )
}

pub fn tailored_resume_type() -> OutputType {
    OutputType::new(
        "TailoredResume",
        resume_schema(&["summary", "skills", "experience"]),
    )
}

pub fn checklist_type() -> OutputType {
    OutputType::new(
        "Checklist",
        json!({
            "type": "object",
            "required": ["hardRequirements", "softRequirements", "keywords"],
            "properties": {
                "hardRequirements": string_list(),
                "softRequirements": string_list(),
                "keywords": string_list(),
            },
        }),
    )
}

pub fn matched_checklist_type() -> OutputType {
    OutputType::new(
        "MatchedChecklist",
        json!({
            "type": "object",
            "required": ["items"],
            "properties": {
                "items": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["requirement", "category", "matched"],
                        "properties": {
                            "requirement": {"type": "string"},
                            "category": {"enum": ["hard", "soft", "keyword"]},
                            "matched": {"type": "boolean"},
                            "evidence": {"type": ["string", "null"]},
                        },
                    },
                },
            },
        }),
    )
}

pub fn job_metadata_type() -> OutputType {
    OutputType::new(
        "JobMetadata",
        json!({
            "type": "object",
            "required": ["title", "company"],
            "properties": {
                "title": {"type": "string"},
                "company": {"type": "string"},
                "location": {"type": ["string", "null"]},
                "seniority": {"type": ["string", "null"]},
                "salaryRange": {"type": ["string", "null"]},
            },
        }),
    )
}

pub fn score_type() -> OutputType {
    OutputType::new(
        "MatchScore",
        json!({
            "type": "object",
            "required": ["score", "breakdown"],
            "properties": {
                "score": {"type": "integer"},
                "breakdown": {"type": "object"},
            },
        }),
    )
}

pub fn contracts() -> Vec<TaskContract> {
    vec![
        TaskContract::new(RESUME_PARSING, parsed_resume_type())
            .input("resumeText")
            .provides("parsedResume"),
        TaskContract::new(CHECKLIST_PARSING, checklist_type())
            .input("jobDescription")
            .provides("checklist"),
        TaskContract::new(CHECKLIST_MATCHING, matched_checklist_type())
            .input("checklist")
            .input("parsedResume")
            .provides("matchedChecklist"),
        TaskContract::new(RESUME_TAILORING, tailored_resume_type())
            .input("parsedResume")
            .input("matchedChecklist")
            .input("jobDescription")
            .provides("tailoredResume")
            .streaming(),
        // Metadata and score belong to the job record, not the context.
        TaskContract::new(JOB_METADATA, job_metadata_type()).input("jobDescription"),
        TaskContract::new(SCORE_CALCULATION, score_type()).input("matchedChecklist"),
    ]
}

/// Prompts for every LLM-backed kind, keyed by kind.
pub fn prompts() -> Vec<(&'static str, PromptSpec)> {
    vec![
        (
            RESUME_PARSING,
            PromptSpec::new(
                "You extract structured data from resumes. Copy facts verbatim; never invent employers, dates or skills.",
                "Parse this resume:\n\n{{resumeText}}",
                parsed_resume_type(),
            ),
        ),
        (
            CHECKLIST_PARSING,
            PromptSpec::new(
                "You turn job descriptions into requirement checklists. Hard requirements are must-haves, soft requirements are nice-to-haves, keywords are tools and domain terms.",
                "Build the checklist for this job description:\n\n{{jobDescription}}",
                checklist_type(),
            ),
        ),
        (
            CHECKLIST_MATCHING,
            PromptSpec::new(
                "You check a candidate against a requirement checklist. Mark a requirement matched only when the resume shows evidence, and quote that evidence.",
                "Checklist:\n{{checklist}}\n\nResume:\n{{parsedResume}}",
                matched_checklist_type(),
            ),
        ),
        (
            RESUME_TAILORING,
            PromptSpec::new(
                "You tailor resumes to a job. Reorder and rephrase existing experience to surface matched requirements. Do not add experience the candidate does not have.",
                "Job description:\n{{jobDescription}}\n\nMatched checklist:\n{{matchedChecklist}}\n\nResume:\n{{parsedResume}}",
                tailored_resume_type(),
            ),
        ),
        (
            JOB_METADATA,
            PromptSpec::new(
                "You extract posting metadata from job descriptions. Use null for anything the posting does not state.",
                "Extract the metadata of this job description:\n\n{{jobDescription}}",
                job_metadata_type(),
            ),
        ),
    ]
}
