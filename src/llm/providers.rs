/// Google Gemini `generateContent` client
pub mod gemini;
