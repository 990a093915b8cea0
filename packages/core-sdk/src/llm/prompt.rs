use crate::models::Language;

/**
 * \brief Prompt 构造策略，按 (diagram_type, language) 参数化，供所有 Provider 复用。
 */
pub trait PromptBuilder: Send + Sync {
    fn description_prompt(&self, diagram_code: &str, diagram_type: &str, language: Language)
        -> String;

    fn diagram_prompt(&self, description: &str, diagram_type: &str, language: Language) -> String;

    fn improvement_prompt(
        &self,
        diagram_code: &str,
        improvement_request: &str,
        diagram_type: &str,
        language: Language,
    ) -> String;
}

/**
 * \brief 图表语法，只有 Mermaid 与 PlantUML 拥有专门的上下文。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagramSyntax {
    Mermaid,
    PlantUml,
    Other,
}

impl DiagramSyntax {
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "mermaid" => DiagramSyntax::Mermaid,
            "plantuml" => DiagramSyntax::PlantUml,
            _ => DiagramSyntax::Other,
        }
    }
}

/**
 * \brief 默认模板（es/en）。
 */
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardPrompts;

impl PromptBuilder for StandardPrompts {
    fn description_prompt(
        &self,
        diagram_code: &str,
        diagram_type: &str,
        language: Language,
    ) -> String {
        match language {
            Language::Es => format!(
                r#"Eres un experto en análisis de diagramas técnicos. Analiza el siguiente código de diagrama tipo {diagram_type} y genera una descripción técnica clara y concisa en español.

Código del diagrama:
```
{diagram_code}
```

Genera una descripción profesional en formato Markdown que incluya:
1. **Propósito**: objetivo principal del diagrama
2. **Componentes clave**: elementos principales y su función
3. **Flujo/Relaciones**: cómo interactúan los componentes
4. **Casos de uso**: cuándo usar este diagrama

La descripción debe tener entre 100 y 300 palabras.

IMPORTANTE: devuelve ÚNICAMENTE el contenido Markdown, SIN bloques de código (```markdown) y SIN prefijos."#
            ),
            Language::En => format!(
                r#"You are an expert in technical diagram analysis. Analyze the following {diagram_type} diagram code and write a clear, concise technical description in English.

Diagram code:
```
{diagram_code}
```

Write a professional Markdown description that covers:
1. **Purpose**: the main goal of the diagram
2. **Key components**: the main elements and their role
3. **Flow/Relations**: how the components interact
4. **Use cases**: when this diagram is useful

The description must be between 100 and 300 words.

IMPORTANT: return ONLY the Markdown content, WITHOUT code fences (```markdown) and WITHOUT any prefix."#
            ),
        }
    }

    fn diagram_prompt(&self, description: &str, diagram_type: &str, language: Language) -> String {
        let context = syntax_context(DiagramSyntax::from_tag(diagram_type), language);
        match language {
            Language::Es => format!(
                r#"Eres un experto en crear diagramas {diagram_type} claros, simples y funcionales.

{context}

DESCRIPCIÓN DEL USUARIO:
{description}

INSTRUCCIONES:
1. Crea un diagrama SIMPLE que capture los aspectos esenciales de la descripción
2. Usa solo la sintaxis básica necesaria; el diagrama debe ser funcional, no decorativo
3. NO agregues colores, estilos ni íconos
4. PROHIBIDO usar: classDef, style, class, cssClass, fill, stroke o cualquier estilo CSS
5. Genera SOLO el código del diagrama, sin texto adicional y sin bloques ```
6. El código debe ser válido y renderizable, con nombres descriptivos en español

GENERA EL CÓDIGO DEL DIAGRAMA:"#
            ),
            Language::En => format!(
                r#"You are an expert in creating clear, simple and functional {diagram_type} diagrams.

{context}

USER DESCRIPTION:
{description}

INSTRUCTIONS:
1. Create a SIMPLE diagram that captures the essential aspects of the description
2. Use only the basic syntax required; the diagram must be functional, not decorative
3. DO NOT add colors, styles or icons
4. FORBIDDEN: classDef, style, class, cssClass, fill, stroke or any CSS styling
5. Output ONLY the diagram code, no extra text and no ``` fences
6. The code must be valid and renderable, with descriptive names in English

GENERATE THE DIAGRAM CODE:"#
            ),
        }
    }

    fn improvement_prompt(
        &self,
        diagram_code: &str,
        improvement_request: &str,
        diagram_type: &str,
        language: Language,
    ) -> String {
        let context = syntax_context(DiagramSyntax::from_tag(diagram_type), language);
        match language {
            Language::Es => format!(
                r#"Eres un experto en diagramas {diagram_type}. Mejora el diagrama existente manteniendo su simplicidad.

{context}

DIAGRAMA ACTUAL:
```
{diagram_code}
```

SOLICITUD DE MEJORA DEL USUARIO:
{improvement_request}

INSTRUCCIONES:
1. PRESERVA la estructura y la lógica del diagrama original
2. Aplica ÚNICAMENTE los cambios solicitados
3. NO agregues colores, estilos ni decoraciones salvo que el usuario lo pida explícitamente
4. ELIMINA cualquier classDef o style existente, a menos que el usuario pida conservarlos
5. Mantén el idioma del diagrama original
6. Genera SOLO el código mejorado, sin texto adicional y sin bloques ```

GENERA EL CÓDIGO DEL DIAGRAMA MEJORADO:"#
            ),
            Language::En => format!(
                r#"You are an expert in {diagram_type} diagrams. Improve the existing diagram while keeping it simple.

{context}

CURRENT DIAGRAM:
```
{diagram_code}
```

USER'S IMPROVEMENT REQUEST:
{improvement_request}

INSTRUCTIONS:
1. PRESERVE the structure and logic of the original diagram
2. Apply ONLY the requested changes
3. DO NOT add colors, styles or decorations unless the user explicitly asks for them
4. REMOVE any existing classDef or style, unless the user asks to keep them
5. Keep the language of the original diagram
6. Output ONLY the improved code, no extra text and no ``` fences

GENERATE THE IMPROVED DIAGRAM CODE:"#
            ),
        }
    }
}

fn syntax_context(syntax: DiagramSyntax, language: Language) -> &'static str {
    match (syntax, language) {
        (DiagramSyntax::Mermaid, Language::Es) => {
            r#"CONTEXTO MERMAID:
- Tipos: flowchart/graph (TD, LR), sequenceDiagram, classDiagram, stateDiagram-v2, erDiagram, gantt, pie
- Usa solo nodos básicos: [], {}, (), [[]] y flechas simples: -->, ---|texto|
- Subgrafos solo si son necesarios para la organización lógica

EJEMPLO:
```
flowchart TD
    A[Inicio] --> B{Usuario registrado?}
    B -->|Sí| C[Iniciar sesión]
    B -->|No| D[Registrarse]
```"#
        }
        (DiagramSyntax::Mermaid, Language::En) => {
            r#"MERMAID CONTEXT:
- Types: flowchart/graph (TD, LR), sequenceDiagram, classDiagram, stateDiagram-v2, erDiagram, gantt, pie
- Use only basic nodes: [], {}, (), [[]] and simple arrows: -->, ---|text|
- Subgraphs only when needed for logical grouping

EXAMPLE:
```
flowchart TD
    A[Start] --> B{User registered?}
    B -->|Yes| C[Login]
    B -->|No| D[Register]
```"#
        }
        (DiagramSyntax::PlantUml, Language::Es) => {
            r#"CONTEXTO PLANTUML:
- Secuencia, casos de uso, clases, actividad, componentes, estados
- Usa la sintaxis más simple y compatible; evita skinparam
- Siempre entre @startuml y @enduml

EJEMPLO:
```
@startuml
actor Usuario
participant Sistema
Usuario -> Sistema: Solicitud
Sistema --> Usuario: Respuesta
@enduml
```"#
        }
        (DiagramSyntax::PlantUml, Language::En) => {
            r#"PLANTUML CONTEXT:
- Sequence, use case, class, activity, component, state diagrams
- Use the simplest, most compatible syntax; avoid skinparam
- Always wrap in @startuml and @enduml

EXAMPLE:
```
@startuml
actor User
participant System
User -> System: Request
System --> User: Response
@enduml
```"#
        }
        (DiagramSyntax::Other, _) => "",
    }
}
