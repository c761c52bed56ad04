//! Provider-independent prompt builders.
//!
//! The engine hands capabilities structured requests; these helpers turn
//! them into the plain-text prompts most chat-completion backends expect.
//! The engine itself never calls them; a capability is free to ignore them
//! and build its own.

use super::{ConspectusRequest, JudgeRequest, TranscriptEntry, TurnRequest};

const SPEAKER_RULES: &str = "\
Ground rules for the assembly:
- Respond to the specific points other speakers have raised
- Support each claim with reasoning, evidence or an example
- When you agree with someone, say so plainly and build on their point
- When you disagree, say precisely where and offer a counter-argument
- Prefer intellectual honesty over winning
- Be concise; the assembly's time is shared
- Name common ground explicitly when you find it";

/// System prompt for a speaker.
pub fn speaker_system_prompt(display_name: &str, persona: Option<&str>) -> String {
    let mut prompt = format!(
        "You are {display_name}, one voice in a structured, multi-round deliberation \
         among several participants.\n\n"
    );
    if let Some(persona) = persona.map(str::trim).filter(|p| !p.is_empty()) {
        prompt.push_str(&format!("Your assigned perspective: {persona}\n\n"));
    }
    prompt.push_str(SPEAKER_RULES);
    prompt
}

/// User prompt for a speaker's turn, including everything said so far.
pub fn turn_prompt(request: &TurnRequest) -> String {
    let history = if request.transcript.is_empty() {
        "Nobody has spoken yet. Open the deliberation with your position.".to_string()
    } else {
        format!(
            "The deliberation so far:\n\n{}",
            render_entries(&request.transcript, false)
        )
    };
    format!(
        "Topic under deliberation: {}\n\n{}\n\nIt is your turn (round {}). Answer the \
         arguments above and move the discussion toward a deeper shared understanding.",
        request.topic, history, request.round
    )
}

/// Prompt asking the moderator for a JSON consensus judgment.
pub fn consensus_prompt(request: &JudgeRequest) -> String {
    let mut prompt = format!(
        "You are an impartial moderator. Assess how far the speakers agree after \
         round {} of a deliberation.\n\nTopic: {}\n\nThis round:\n{}\n",
        request.round,
        request.topic,
        render_entries(&request.round_transcript, false)
    );
    if let Some(previous) = request.previous_round.as_ref().filter(|p| !p.is_empty()) {
        prompt.push_str("\nPrevious round, for comparison:\n");
        for response in previous {
            prompt.push_str(&format!("- {}\n", response));
        }
    }
    prompt.push_str(
        "\nReply with a single JSON object and nothing else:\n\
         {\n  \"consensus_score\": <number from 0.0 (no agreement) to 1.0 (full agreement)>,\n  \
         \"agreed_points\": [<points the speakers share>],\n  \
         \"contested_points\": [<points still in dispute>],\n  \
         \"stagnation\": <true if the arguments repeat without progress>,\n  \
         \"summary\": \"<one sentence on where the deliberation stands>\"\n}",
    );
    prompt
}

/// Prompt for the closing five-section conspectus.
pub fn conspectus_prompt(request: &ConspectusRequest) -> String {
    format!(
        "You are a neutral scribe. The deliberation below has ended after {rounds} \
         round(s). Write a conspectus that synthesises it.\n\n\
         Topic: {topic}\nParticipants: {participants}\nFinal consensus score: {score:.0}%\n\n\
         Full transcript:\n{transcript}\n\n\
         Use exactly these sections:\n\n\
         ## Overview\nWhat was debated and why it matters.\n\n\
         ## Key Arguments\nThe strongest arguments of each participant, attributed by name.\n\n\
         ## Points of Agreement\nWhere the speakers converged.\n\n\
         ## Remaining Disagreements\nWhere positions still diverge, and why.\n\n\
         ## Synthesis\nWhat the assembly can conclude together.",
        rounds = request.rounds,
        topic = request.topic,
        participants = request.participants.join(", "),
        score = request.final_score * 100.0,
        transcript = render_entries(&request.transcript, true),
    )
}

fn render_entries(entries: &[TranscriptEntry], with_round: bool) -> String {
    entries
        .iter()
        .map(|e| {
            if with_round {
                format!("**{}** (round {}): {}", e.speaker, e.round, e.content)
            } else {
                format!("**{}**: {}", e.speaker, e.content)
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
